pub mod acquisition;
pub mod client;
pub mod resources;
pub mod session;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
use sdgen_contracts::config::ServiceConfig;
use sdgen_contracts::events::EventWriter;

pub use acquisition::{AcquisitionHandle, AcquisitionPolicy, AcquisitionSink, ProgressAcquirer};
pub use client::{
    DryrunConfig, DryrunGenerationClient, GenerationClient, HttpGenerationClient, ProgressSource,
    ProgressStream, StreamPoll,
};
pub use resources::{ResourceError, ResourceHandle, ResourceSlot, ResourceStore};
pub use session::{SessionError, SessionMachine, SessionSnapshot, SessionStatus};

/// Picks the dry-run client when `dryrun` is set, the HTTP client otherwise.
pub fn build_client(
    config: &ServiceConfig,
    dryrun: Option<DryrunConfig>,
) -> Result<Arc<dyn GenerationClient>> {
    if let Some(dryrun) = dryrun {
        return Ok(Arc::new(DryrunGenerationClient::new(dryrun)));
    }
    let client = HttpGenerationClient::new(config.clone())
        .with_context(|| format!("failed to build HTTP client for {}", config.api_base))?;
    Ok(Arc::new(client))
}

/// A fresh session wired with the acquisition policy and default model from `config`.
pub fn open_session(
    config: &ServiceConfig,
    client: Arc<dyn GenerationClient>,
    events: EventWriter,
) -> SessionMachine {
    let acquirer = ProgressAcquirer::new(client, AcquisitionPolicy::from_config(config));
    SessionMachine::new(acquirer, events, config.default_model.clone())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sdgen_contracts::config::ProgressTransport;

    use super::*;

    #[test]
    fn open_session_uses_configured_model_and_policy() -> anyhow::Result<()> {
        let config = ServiceConfig {
            default_model: "sd-v2-1".to_string(),
            transport: ProgressTransport::Poll,
            ..ServiceConfig::default()
        };
        let client = build_client(&config, Some(DryrunConfig::default()))?;
        assert_eq!(client.name(), "dryrun");

        let machine = open_session(&config, client, EventWriter::in_memory("s1"));
        assert_eq!(machine.session().model, "sd-v2-1");
        assert_eq!(machine.session().status, SessionStatus::Idle);
        let created = machine.events().recorded_of_type("session_created");
        assert_eq!(created[0]["transport"], "poll");
        assert_eq!(created[0]["client"], "dryrun");
        Ok(())
    }

    #[test]
    fn build_client_defaults_to_http() -> anyhow::Result<()> {
        let config = ServiceConfig {
            request_timeout: Duration::from_secs(5),
            ..ServiceConfig::default()
        };
        let client = build_client(&config, None)?;
        assert_eq!(client.name(), "http");
        assert!(client.supports_progress_stream());
        Ok(())
    }
}
