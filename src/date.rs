//! Cached value of the `Date` header
//!
//! The value only changes once a second, so it's formatted at most once a
//! second per thread.
use std::cell::RefCell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use httpdate::HttpDate;


struct CachedDate {
    value: String,
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate {
    value: String::new(),
    next_update: UNIX_EPOCH,
}));

impl CachedDate {
    fn check(&mut self) {
        let now = SystemTime::now();
        if now >= self.next_update {
            let nanos = now.duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos();
            self.value = HttpDate::from(now).to_string();
            self.next_update = now + Duration::new(1, 0)
                - Duration::from_nanos(nanos as u64);
        }
    }
}

/// Appends current date to the header block
pub fn extend(dst: &mut String) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.push_str(&cache.value);
    })
}

pub fn now() -> String {
    let mut value = String::with_capacity(29);
    extend(&mut value);
    value
}

/// Formats arbitrary time, e.g. for `Expires` and `Last-Modified`
pub fn format(time: SystemTime) -> String {
    HttpDate::from(time).to_string()
}
