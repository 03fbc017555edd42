//! Shared utility functions

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

/// Compile a regex, consulting a process-wide cache.
///
/// Patterns come from the config document and the bundled transformer
/// assets, so the cache stays small and compilation cost is paid once per
/// pattern rather than per request.
pub fn cached_regex(pattern: &str) -> Result<Arc<Regex>, regex::Error> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Regex>>>> = OnceLock::new();

    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let re = Arc::new(Regex::new(pattern)?);
    if let Ok(mut guard) = cache.lock() {
        guard.insert(pattern.to_string(), re.clone());
    }
    Ok(re)
}

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8
/// boundaries. Keeps debug logs of request bodies bounded.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
