use std::sync::Arc;

use anyhow::{Result, anyhow};
use envelope::Packer;
use rand::seq::SliceRandom as _;

use crate::tunnel::Tunnel;

/// One [`Tunnel`] per configured remote URL, created eagerly with a lazy
/// first dial.
pub(crate) struct Pool {
    tunnels: Vec<Arc<Tunnel>>,
}

impl Pool {
    pub(crate) fn new(urls: Vec<String>, packer: &Packer) -> Self {
        let tunnels = urls
            .into_iter()
            .map(|url| Arc::new(Tunnel::new(url, envelope::random_id(3), packer.clone())))
            .collect();

        Self { tunnels }
    }

    pub(crate) fn tunnels(&self) -> &[Arc<Tunnel>] {
        &self.tunnels
    }

    /// Picks a usable tunnel for a new stream.
    ///
    /// Candidates are visited in random order to spread streams. Broken
    /// tunnels are skipped (their supervisors keep force-retrying in the
    /// background), already-connected ones win, everything else gets one dial
    /// attempt.
    pub(crate) async fn pick(&self) -> Result<Arc<Tunnel>> {
        let mut order = self.tunnels.iter().collect::<Vec<_>>();
        order.shuffle(&mut rand::thread_rng());

        for tunnel in order {
            if !tunnel.can_connect() {
                // make sure the supervisor is retrying
                tunnel.wake.notify_one();
                continue;
            }

            if tunnel.connected() {
                return Ok(Arc::clone(tunnel));
            }

            match tunnel.dial(false).await {
                Ok(()) => return Ok(Arc::clone(tunnel)),
                Err(e) => {
                    tracing::debug!(url = %tunnel.url, "Dial failed during pick: {e}");
                }
            }
        }

        Err(anyhow!("all tunnels unreachable"))
    }
}
