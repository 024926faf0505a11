use anyhow::{Context, Result};
use crate::mdns;
use std::{net::SocketAddr, time::Duration};

#[derive(clap::Args, Clone, Debug)]
pub struct TargetArgs {
    /// Cast device friendly name, IP address, `IP:PORT`, or host name.
    ///
    /// Without this the first device found on the network is used.
    #[arg(long, short = 'd', value_name = "NAME_OR_ADDR")]
    pub device: Option<String>,

    /// How long to scan the network for devices, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = mdns::DISCOVER_TIMEOUT.as_secs())]
    pub discover_timeout: u64,
}

impl TargetArgs {
    pub fn discover_timeout(&self) -> Duration {
        Duration::from_secs(self.discover_timeout)
    }

    pub async fn resolve(&self) -> Result<mdns::Device> {
        mdns::resolve_with_timeout(self.device.as_deref(), self.discover_timeout()).await
            .with_context(|| match self.device {
                Some(ref device) => format!("resolving cast device {device:?}"),
                None => "looking for any cast device".to_string(),
            })
    }

    pub async fn resolve_to_socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.resolve().await?.addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(clap::Parser, Debug)]
    struct Cli {
        #[clap(flatten)]
        target: TargetArgs,
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["cli"]).unwrap();
        assert_eq!(cli.target.device, None);
        assert_eq!(cli.target.discover_timeout(), mdns::DISCOVER_TIMEOUT);
    }

    #[tokio::test]
    async fn literal_address_resolves_without_scan() {
        let cli = Cli::try_parse_from(["cli", "--device", "10.0.0.5"]).unwrap();
        assert_eq!(cli.target.resolve_to_socket_addr().await.unwrap(),
                   "10.0.0.5:8009".parse::<SocketAddr>().unwrap());
    }
}
