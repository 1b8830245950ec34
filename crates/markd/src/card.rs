/// Display helpers for a single bookmark row
use chrono::{DateTime, Utc};
use url::Url;

/// Hostname without a leading `www.`, or the input when it does not parse
pub fn domain(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.strip_prefix("www.").unwrap_or(host).to_string(),
            None => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Relative age: `just now`, `5m ago`, `3h ago`, `2d ago`, then `Jan 5`
pub fn format_age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - created_at).num_minutes();
    let hours = minutes / 60;
    let days = hours / 24;

    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if hours < 24 {
        format!("{}h ago", hours)
    } else if days < 7 {
        format!("{}d ago", days)
    } else {
        created_at.format("%b %-d").to_string()
    }
}
