//! Watches network and preference changes during a runner activation.

use crate::config::DownloadPreferences;
use crate::scheduler::{DeviceConditions, NetworkType};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Network requirement implied by the preferences
pub(crate) fn required_network(preferences: &DownloadPreferences) -> NetworkType {
    if preferences.only_on_unmetered {
        NetworkType::Unmetered
    } else {
        NetworkType::Connected
    }
}

/// Why the runner may not keep downloading, if it may not
pub(crate) fn network_violation(
    conditions: &DeviceConditions,
    preferences: &DownloadPreferences,
) -> Option<String> {
    required_network(preferences).violation(&conditions.network)
}

/// Cancel `token` as soon as a change event violates the network condition
///
/// The violation is recorded in `reason` before the token fires. Returns when
/// the token is cancelled by anyone.
pub(crate) async fn watch_network(
    mut conditions: watch::Receiver<DeviceConditions>,
    mut preferences: watch::Receiver<DownloadPreferences>,
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
) {
    let mut conditions_open = true;
    let mut preferences_open = true;

    loop {
        if !conditions_open && !preferences_open {
            token.cancelled().await;
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            changed = conditions.changed(), if conditions_open => {
                conditions_open = changed.is_ok();
            }
            changed = preferences.changed(), if preferences_open => {
                preferences_open = changed.is_ok();
            }
        }

        let violation = network_violation(&conditions.borrow_and_update(), &preferences.borrow_and_update());
        if let Some(violation) = violation {
            info!(reason = %violation, "Network condition no longer holds, stopping runner");
            reason.set(violation).ok();
            token.cancel();
            return;
        }
    }
}
