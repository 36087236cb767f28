use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "magpie",
    version,
    about = "Self-hosted GitHub code-review bot",
    long_about = "Magpie listens for @magpie commands in pull-request comments, \
queues review tasks in Redis, and posts inline review feedback produced by a \
language-model CLI.\n\nRun `magpie serve` for the webhook ingress and \
`magpie work` for the review workers; the two processes share the queue."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the webhook ingress HTTP server")]
    Serve {
        #[arg(long, help = "Listen address, overrides MAGPIE_HTTP_ADDR")]
        addr: Option<String>,
    },
    #[command(about = "Run the review worker pool")]
    Work {
        #[arg(long, help = "Worker concurrency, overrides MAGPIE_CONCURRENCY")]
        concurrency: Option<usize>,
    },
    #[command(about = "Print resolved configuration and check datastore connectivity")]
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_parses_with_addr_override() {
        let cli = Cli::try_parse_from(["magpie", "serve", "--addr", "127.0.0.1:9999"])
            .expect("parse");
        match cli.command {
            Commands::Serve { addr } => assert_eq!(addr.as_deref(), Some("127.0.0.1:9999")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn work_parses_with_concurrency_override() {
        let cli = Cli::try_parse_from(["magpie", "work", "--concurrency", "8"]).expect("parse");
        match cli.command {
            Commands::Work { concurrency } => assert_eq!(concurrency, Some(8)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["magpie"]).is_err());
    }
}
