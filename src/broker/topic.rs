//! Topic filter matching and validation.
//!
//! Topics and filters are split on `/` and compared level by level. Empty
//! levels count as levels, so `a//b` has three and `/a` has two.

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Returns true when `topic` is selected by `filter`.
///
/// `#` matches its own level and everything below it, so `sport/#` also
/// matches `sport`. `+` matches exactly one level. Topics whose first level
/// starts with `$` are never selected by a filter that starts with a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    if topic.starts_with('$') && (filter.starts_with(SINGLE_LEVEL) || filter.starts_with(MULTI_LEVEL))
    {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validates a subscription filter.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(i, level)| {
        if level.contains('#') {
            *level == MULTI_LEVEL && i == last
        } else if level.contains('+') {
            *level == SINGLE_LEVEL
        } else {
            true
        }
    })
}

/// Validates a topic name used in PUBLISH or as a will topic.
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}
