use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "leasehold", version, about, long_about = None)]
pub struct Cli {
    /// TOML config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Store gateway endpoint, overrides the config file
    #[arg(short, long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Campaigns for leadership and holds it until Ctrl-C or until it is lost
    Campaign {
        election: String,
        /// Published as the leader's value; defaults to a random id
        identity: Option<String>,
    },
    /// Prints every leadership change
    Observe { election: String },
    /// Prints the current leader
    Leader { election: String },
    /// Withdraws the candidacy held under an existing lease
    Resign {
        election: String,
        /// Lease id in hex, as printed by `campaign`
        #[arg(long, value_parser = parse_lease)]
        lease: coord::LeaseId,
    },
}

fn parse_lease(s: &str) -> Result<coord::LeaseId, String> {
    s.parse().map_err(|e: coord::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_campaign() {
        let cli = Cli::parse_from(["leasehold", "-vv", "campaign", "jobs", "node-a"]);
        assert_eq!(cli.verbosity, 2);
        match cli.command {
            Commands::Campaign { election, identity } => {
                assert_eq!(election, "jobs");
                assert_eq!(identity.as_deref(), Some("node-a"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_resign_lease() {
        let cli = Cli::parse_from([
            "leasehold",
            "--endpoint",
            "http://10.0.0.5:2379",
            "resign",
            "jobs",
            "--lease",
            "694d77aa1d2f0b07",
        ]);
        assert_eq!(cli.endpoint.as_deref(), Some("http://10.0.0.5:2379"));
        match cli.command {
            Commands::Resign { lease, .. } => assert_eq!(lease, coord::LeaseId(0x694d_77aa_1d2f_0b07)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_bad_lease_is_rejected() {
        assert!(Cli::try_parse_from(["leasehold", "resign", "jobs", "--lease", "zz"]).is_err());
    }
}
