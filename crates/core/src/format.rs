//! Alert message rendering (Telegram HTML).

use monitor_api::{format_num, Opportunity};

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
pub fn metric_change_alert(
    source: &str,
    metric: &str,
    prev: f64,
    curr: f64,
    change: f64,
    window: i64,
    increase: bool,
    link: &str,
) -> String {
    let (label, verb, sign) = if increase {
        ("INCREASE", "increased", "+")
    } else {
        ("DROP", "dropped", "-")
    };
    let metric_upper = metric.to_uppercase();
    format!(
        "🚨 <b>{} {} {} ALERT</b>\n\n{} {} by {:.1}% over the last {} poll(s)!\nPrevious: ${}\nCurrent:  ${}\nChange:   {}${}\n\n🔗 {}",
        source.to_uppercase(),
        metric_upper,
        label,
        metric_upper,
        verb,
        change * 100.0,
        window,
        format_num(prev),
        format_num(curr),
        sign,
        format_num((prev - curr).abs()),
        link
    )
}

pub fn value_alert(source: &str, metric: &str, value: f64, threshold: f64, higher: bool, link: &str) -> String {
    let (label, cmp) = if higher { ("ABOVE", "&gt;") } else { ("BELOW", "&lt;") };
    let metric_upper = metric.to_uppercase();
    format!(
        "🚨 <b>{} {} {} THRESHOLD</b>\n\n{} is now {} {} {}!\nCurrent: {}\nThreshold: {}\n\n🔗 {}",
        source.to_uppercase(),
        metric_upper,
        label,
        metric_upper,
        cmp,
        label,
        format_num(threshold),
        format_num(value),
        format_num(threshold),
        link
    )
}

pub fn maxpain_alert(coin: &str, side: &str, interval: &str, price: f64, level: f64, distance: f64, link: &str) -> String {
    let side_label = side.to_uppercase();
    format!(
        "🚨 <b>{coin} {side_label} MAX PAIN ALERT ({interval})</b>\n\n{coin} price (${}) is within {distance:.1}% of {side_label} max pain (${})!\n\nCurrent Price: ${}\n{side_label} Max Pain: ${}\nInterval: {interval}\n\n🔗 {link}",
        format_num(price),
        format_num(level),
        format_num(price),
        format_num(level),
    )
}

pub fn price_target_alert(coin: &str, price: f64, target: f64, increase: bool, link: &str) -> String {
    let label = if increase { "⬆️ INCREASE" } else { "⬇️ DECREASE" };
    format!(
        "🚨 <b>{coin}/USDT PRICE {label} ALERT</b>\n\n{coin} has reached your target price!\n\nCurrent Price: ${}\nTarget Price:  ${}\n\n🔗 {link}",
        format_num(price),
        format_num(target),
    )
}

/// One message listing every new opportunity, highest APR first.
pub fn opportunity_alert(source: &str, opportunities: &[Opportunity]) -> String {
    let mut sorted: Vec<&Opportunity> = opportunities.iter().collect();
    sorted.sort_by(|a, b| b.apr.total_cmp(&a.apr));

    let mut text = if sorted.len() == 1 {
        format!("💰 <b>New {} Opportunity</b>\n\n", escape_html(source))
    } else {
        format!("💰 <b>{} New {} Opportunities</b>\n\n", sorted.len(), escape_html(source))
    };

    for (i, opp) in sorted.iter().enumerate() {
        let stable = if opp.stablecoin { " 🟢" } else { "" };
        text.push_str(&format!("{}. {}{}\n", i + 1, escape_html(&opp.name), stable));
        text.push_str(&format!("   APR: {:.1}% | TVL: ${}\n", opp.apr, compact_tvl(opp.tvl)));
        text.push_str(&format!(
            "   {} · {} · {}\n",
            escape_html(&opp.chain),
            escape_html(&opp.tag),
            escape_html(&opp.protocol)
        ));
        if !opp.link.is_empty() {
            text.push_str(&format!("   🔗 {}\n", opp.link));
        }
        if i + 1 < sorted.len() {
            text.push('\n');
        }
    }
    text
}

fn compact_tvl(v: f64) -> String {
    if v >= 1_000_000.0 {
        format!("{:.1}M", v / 1_000_000.0)
    } else if v >= 1_000.0 {
        format!("{:.0}K", v / 1_000.0)
    } else {
        format!("{:.0}", v)
    }
}
