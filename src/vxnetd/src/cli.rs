//! CLI definition using clap

use std::path::PathBuf;

use clap::Parser;

/// vxnetd - VXLAN overlay node daemon
#[derive(Parser, Debug)]
#[command(name = "vxnetd")]
#[command(version)]
#[command(about = "Maintains the vxnet VXLAN overlay on this node", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(long, short, value_name = "PATH", help = "Configuration file (default: /etc/vxnet/vxnetd.toml)")]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    pub log_level: String,

    /// Name of the node this daemon runs on
    #[arg(long, value_name = "NAME")]
    pub node_name: Option<String>,

    /// Kubeconfig to reach the API server with
    #[arg(long, value_name = "PATH")]
    pub kubeconfig: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["vxnetd"]);
        assert_eq!(cli.log_level, "info");
        assert!(cli.config.is_none());
        assert!(cli.node_name.is_none());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "vxnetd",
            "--config",
            "/tmp/vxnetd.toml",
            "--node-name",
            "node-a",
            "--kubeconfig",
            "/root/.kube/config",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/vxnetd.toml")));
        assert_eq!(cli.node_name.as_deref(), Some("node-a"));
        assert_eq!(cli.kubeconfig, Some(PathBuf::from("/root/.kube/config")));
        assert_eq!(cli.log_level, "debug");
    }
}
