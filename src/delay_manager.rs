use std::time::Duration;
use log::{debug, info};
use rand::Rng;

/// Waits for client-side rendering to finish after a page load.
pub async fn settle(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    debug!("Waiting {:?} for the page to settle...", delay);
    tokio::time::sleep(delay).await;
}

/// Pause before re-requesting a listing page that failed or hit an interstitial.
/// Adds up to 50% random jitter.
pub async fn list_retry(base: Duration) {
    if base.is_zero() {
        return;
    }
    let extra_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(0..=base.as_millis() as u64 / 2)
    };
    let delay = base + Duration::from_millis(extra_ms);
    info!("Waiting {:?} before retrying the listing page...", delay);
    tokio::time::sleep(delay).await;
}

/// Fixed pause between save attempts while the output file is locked.
pub async fn lock_backoff(backoff: Duration) {
    if backoff.is_zero() {
        return;
    }
    info!("Waiting {:?} for the output file to be released...", backoff);
    tokio::time::sleep(backoff).await;
}
