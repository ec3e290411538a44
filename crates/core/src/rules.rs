//! Rule interpretation for subscriptions.
//!
//! Pure functions: no I/O, no dedup. The engine decides what to send.

use monitor_store::SubscriptionRule;

/// Direction of an absolute-threshold rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDirection {
    Higher,
    Lower,
}

impl ThresholdDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Higher => "higher",
            Self::Lower => "lower",
        }
    }

    pub fn triggered(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Higher => value > threshold,
            Self::Lower => value < threshold,
        }
    }
}

/// How a per-source metric subscription is evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricRule {
    /// Fire while `value` is beyond `threshold`.
    Absolute {
        direction: ThresholdDirection,
        threshold: f64,
    },
    /// Fire when the change over `window` cycles reaches `threshold` (a fraction).
    Percentage {
        increase: bool,
        window: i64,
        threshold: f64,
    },
}

impl MetricRule {
    /// Absolute rules take precedence when a positive threshold value is set.
    pub fn from_rule(rule: &SubscriptionRule) -> Self {
        let absolute = match rule.direction.as_str() {
            "higher" => Some(ThresholdDirection::Higher),
            "lower" => Some(ThresholdDirection::Lower),
            _ => None,
        };
        match absolute {
            Some(direction) if rule.threshold_value > 0.0 => Self::Absolute {
                direction,
                threshold: rule.threshold_value,
            },
            _ => Self::Percentage {
                increase: rule.direction == "increase",
                window: rule.window,
                threshold: rule.threshold_pct / 100.0,
            },
        }
    }

    /// Label used in dedup keys and messages.
    pub fn direction_label(&self) -> &'static str {
        match self {
            Self::Absolute { direction, .. } => direction.as_str(),
            Self::Percentage { increase: true, .. } => "increase",
            Self::Percentage { increase: false, .. } => "drop",
        }
    }
}

/// Change of `curr` relative to `prev` in the watched direction. None when `prev` is not positive.
pub fn percentage_change(prev: f64, curr: f64, increase: bool) -> Option<f64> {
    if prev <= 0.0 {
        return None;
    }
    Some(if increase {
        (curr - prev) / prev
    } else {
        (prev - curr) / prev
    })
}

/// A window is usable only when a snapshot exactly `window` cycles back exists.
pub fn window_available(window: i64, history_len: usize) -> Option<usize> {
    let window = usize::try_from(window).ok()?;
    (window >= 1 && window < history_len).then_some(window)
}

/// Max-pain interval label for a window given in minutes.
pub fn interval_from_minutes(minutes: i64) -> &'static str {
    match minutes {
        720 => "12h",
        1440 => "24h",
        2880 => "48h",
        4320 => "3d",
        10080 => "7d",
        20160 => "2w",
        43200 => "1M",
        _ => "24h",
    }
}

/// Look-back duration (seconds) for an interval label.
pub fn interval_secs(label: &str) -> u64 {
    const HOUR: u64 = 3600;
    match label {
        "12h" => 12 * HOUR,
        "48h" => 48 * HOUR,
        "3d" => 72 * HOUR,
        "7d" => 7 * 24 * HOUR,
        "2w" => 14 * 24 * HOUR,
        "1M" => 30 * 24 * HOUR,
        _ => 24 * HOUR,
    }
}

/// Which max-pain level a subscription watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxPainSide {
    Long,
    Short,
}

impl MaxPainSide {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

/// Distance from `price` to `level` as a percentage of price.
pub fn proximity_pct(price: f64, level: f64) -> f64 {
    (price - level).abs() / price * 100.0
}

/// Direction of a price-target subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceDirection {
    Increase,
    Decrease,
}

impl PriceDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "increase" => Some(Self::Increase),
            "decrease" => Some(Self::Decrease),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Increase => "increase",
            Self::Decrease => "decrease",
        }
    }

    pub fn reached(&self, price: f64, target: f64) -> bool {
        match self {
            Self::Increase => price >= target,
            Self::Decrease => price <= target,
        }
    }
}
