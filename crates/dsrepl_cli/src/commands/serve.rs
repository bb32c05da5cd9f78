//! Serve command implementation.

use dsrepl_core::normalize_dn;
use dsrepl_server::{DomainConfig, ReplicationServer, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Options of the serve command.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Server id.
    pub server_id: u16,
    /// Listen address.
    pub bind: SocketAddr,
    /// Domains opened at startup.
    pub domains: Vec<String>,
    /// Domains kept out of the external changelog.
    pub ecl_excluded: Vec<String>,
    /// Purge delay in seconds.
    pub purge_delay_secs: u64,
    /// Session limit.
    pub max_sessions: usize,
}

/// Builds the server configuration for `options`.
pub fn build_config(root: &Path, options: &ServeOptions) -> ServerConfig {
    let mut config = ServerConfig::new(options.server_id, root)
        .with_bind_addr(options.bind)
        .with_purge_delay(Duration::from_secs(options.purge_delay_secs))
        .with_max_sessions(options.max_sessions);
    for base_dn in &options.domains {
        config = config.with_domain(DomainConfig::new(base_dn.as_str()));
    }
    config.runtime.ecl_excluded = options.ecl_excluded.iter().map(|dn| normalize_dn(dn)).collect();
    config
}

/// Runs the serve command until Ctrl-C.
pub fn run(root: &Path, options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(root, &options);
    let server = ReplicationServer::open(config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupt received, shutting down");
                server.shutdown();
                serving.await??;
            }
            finished = &mut serving => {
                // serve only returns early on a bind failure
                finished??;
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    println!("Server stopped; state saved for {} domain(s)", server.base_dns().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_map_onto_config() {
        let options = ServeOptions {
            server_id: 7,
            bind: SocketAddr::from(([127, 0, 0, 1], 9000)),
            domains: vec!["dc=example,dc=com".into(), "o=other".into()],
            ecl_excluded: vec!["O=Other".into()],
            purge_delay_secs: 60,
            max_sessions: 5,
        };
        let config = build_config(Path::new("/tmp/dsrepl"), &options);
        assert_eq!(config.server_id, 7);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.runtime.purge_delay, Duration::from_secs(60));
        assert!(config.runtime.ecl_excluded.contains("o=other"));
        assert_eq!(config.max_sessions, 5);
        assert!(config.validate().is_ok());
    }
}
