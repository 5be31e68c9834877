use time::{OffsetDateTime, format_description::well_known::Rfc3339, macros::format_description};

/// Normalize a branch or tag name for use in storage prefixes and host names.
/// Lowercases, collapses every run of non-alphanumeric characters into a single `-`
/// and trims leading and trailing dashes.
pub fn sanitize_ref(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !out.is_empty() {
                out.push('-');
            }
            dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
    }
    out
}

/// Storage prefix of one branch in the code bus, with a trailing slash.
pub fn code_prefix(owner: &str, repo: &str, ref_name: &str) -> String {
    format!("{owner}/{repo}/{ref_name}/")
}

/// Surrogate key covering every cached response of a branch.
pub fn site_key(owner: &str, repo: &str, ref_name: &str) -> String {
    format!("{ref_name}--{owner}--{repo}")
}

/// Surrogate key covering the code-bus resources of a branch.
pub fn code_key(owner: &str, repo: &str, ref_name: &str) -> String {
    format!("{}_code", site_key(owner, repo, ref_name))
}

pub fn head_key(owner: &str, repo: &str, ref_name: &str) -> String {
    format!("{}_head", site_key(owner, repo, ref_name))
}

pub fn config_key(owner: &str, repo: &str, ref_name: &str) -> String {
    format!("{}_config", site_key(owner, repo, ref_name))
}

/// Format a timestamp as an HTTP date, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
pub fn http_date(value: OffsetDateTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    value.to_offset(time::UtcOffset::UTC).format(format).unwrap_or_default()
}

/// Convert an RFC 3339 timestamp (as returned by the commits API) to an HTTP date.
pub fn rfc3339_to_http_date(value: &str) -> Option<String> {
    OffsetDateTime::parse(value, &Rfc3339).ok().map(http_date)
}

/// Format a size in bytes to a human-readable string.
/// Uses SI (kilo = 1000) units, formatted to two decimal places.
pub fn size(value: u64) -> String {
    let units = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let mut value = value as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < units.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, units[unit])
}
