use crate::prelude::*;
use std::any::Any;

pub(crate) mod fs;
pub(crate) mod hex;

pub fn report_panic(e: &dyn Any) {
    if let Some(e) = e.downcast_ref::<String>() {
        error!("panicked: {}", e)
    } else if let Some(e) = e.downcast_ref::<&'static str>() {
        error!("panicked: {}", e)
    } else {
        error!("panicked")
    }
}

pub fn report_failure(err: &anyhow::Error) {
    error!("{}", err);
    for cause in err.chain().skip(1) {
        error!("caused by: {}", cause);
    }
}

/// Retries a fallible operation with jittered exponential backoff, up to
/// `max_attempts` total tries.
pub fn retry_with_backoff<T, F>(max_attempts: u32, mut f: F) -> Fallible<T>
where
    F: FnMut() -> Fallible<T>,
{
    use rand::Rng;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                let base_ms = 250u64 * 2u64.pow(attempt - 1);
                let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
                let delay = std::time::Duration::from_millis(base_ms + jitter_ms);
                warn!("attempt {attempt}/{max_attempts} failed: {err:#}; retrying in {delay:?}");
                std::thread::sleep(delay);
            }
        }
    }
}
