use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use gpo_write_audit::credentials::{CredentialContext, CurrentUser, ExplicitCredentials, FixedIdentity};
use gpo_write_audit::directory::DirectoryService;
use gpo_write_audit::ldap_directory::LdapDirectory;
use gpo_write_audit::logging::init_logging;
use gpo_write_audit::parallel_executor::run_blocking;
use gpo_write_audit::policy_store::{PolicyStore, SysvolStore};
use gpo_write_audit::snapshot::SnapshotDirectory;
use gpo_write_audit::{AuditConfig, AuditReport, ExploitabilityEngine};

/// Finds Group Policy Objects an identity can rewrite while they are linked
/// to live users or computers.
#[derive(Parser, Debug)]
#[command(name = "gpo-write-audit", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report exploitable GPO write primitives in a domain
    Detect(DetectArgs),
}

#[derive(clap::Args, Debug)]
struct DetectArgs {
    /// DNS name of the domain to audit
    #[arg(short, long)]
    domain: Option<String>,

    /// Alternate account to bind as
    #[arg(short, long)]
    username: Option<String>,

    /// Password for the alternate account
    #[arg(short, long, requires = "username")]
    password: Option<String>,

    /// Domain controller to query (defaults to the domain name)
    #[arg(long)]
    server: Option<String>,

    /// Use LDAPS on port 636
    #[arg(long)]
    ldaps: bool,

    /// Policies directory to read instead of \\<domain>\SYSVOL\<domain>\Policies
    #[arg(long)]
    sysvol: Option<PathBuf>,

    /// Analyze a captured domain snapshot instead of a live domain
    #[arg(long, conflicts_with_all = ["server", "ldaps", "sysvol"])]
    snapshot: Option<PathBuf>,

    /// Acting identity to assume when analyzing a snapshot
    #[arg(long, requires = "snapshot")]
    identity: Option<String>,

    /// Additional security principal to test for write access
    #[arg(short = 's', long)]
    supplied_principal: Option<String>,

    /// Emit the report as JSON
    #[arg(long)]
    json: bool,

    /// Write the report to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Count gPLink entries that are flagged disabled
    #[arg(long)]
    include_disabled_links: bool,

    /// Ignore deny entries when extracting writers
    #[arg(long)]
    ignore_deny: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => AuditConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AuditConfig::default(),
    };

    match cli.command {
        Commands::Detect(args) => {
            apply_overrides(&mut config, &args);
            cmd_detect(config, args).await
        }
    }
}

fn apply_overrides(config: &mut AuditConfig, args: &DetectArgs) {
    if let Some(n) = args.max_concurrency {
        config.max_concurrency = n;
    }
    if args.include_disabled_links {
        config.include_disabled_links = true;
    }
    if args.ignore_deny {
        config.honor_deny_aces = false;
    }
}

async fn cmd_detect(config: AuditConfig, args: DetectArgs) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let explicit = args
        .username
        .clone()
        .map(|user| ExplicitCredentials::new(user, args.password.clone().unwrap_or_default()));

    let (directory, store, credentials): (
        Arc<dyn DirectoryService>,
        Arc<dyn PolicyStore>,
        Box<dyn CredentialContext>,
    ) = match &args.snapshot {
        Some(path) => {
            let snapshot = SnapshotDirectory::load(path)
                .with_context(|| format!("loading snapshot {}", path.display()))?
                .with_disabled_links(config.include_disabled_links);
            if let Some(domain) = &args.domain {
                if !domain.eq_ignore_ascii_case(snapshot.domain()) {
                    bail!("snapshot is of {}, not {}", snapshot.domain(), domain);
                }
            }
            let snapshot = Arc::new(snapshot);
            let credentials: Box<dyn CredentialContext> = match (&args.identity, explicit) {
                (Some(identity), _) => Box::new(FixedIdentity(identity.clone())),
                (None, Some(creds)) => Box::new(creds),
                (None, None) => Box::new(CurrentUser),
            };
            let directory: Arc<dyn DirectoryService> = snapshot.clone();
            let store: Arc<dyn PolicyStore> = snapshot;
            (directory, store, credentials)
        }
        None => {
            let domain = args
                .domain
                .clone()
                .context("--domain is required unless --snapshot is given")?;
            let creds = explicit.context(
                "live LDAP access requires alternate credentials (-u/-p)",
            )?;

            let directory = {
                let (server, bind_creds, ldap_config, ldap_domain) =
                    (args.server.clone(), creds.clone(), config.clone(), domain.clone());
                let ldaps = args.ldaps;
                let limit = config.connect_timeout() + config.operation_timeout();
                run_blocking(limit, "LDAP connect", move || {
                    LdapDirectory::connect(
                        server.as_deref(),
                        ldaps,
                        &ldap_domain,
                        &bind_creds,
                        &ldap_config,
                    )
                })
                .await
                .with_context(|| format!("connecting to {}", domain))?
            };

            let store = match &args.sysvol {
                Some(path) => SysvolStore::new(path),
                None => SysvolStore::for_domain(&domain),
            };
            let directory: Arc<dyn DirectoryService> = Arc::new(directory);
            let store: Arc<dyn PolicyStore> = Arc::new(store);
            let credentials: Box<dyn CredentialContext> = Box::new(creds);
            (directory, store, credentials)
        }
    };

    info!("Auditing {}", directory.domain());
    let engine = ExploitabilityEngine::new(directory, store, config);
    let report = engine
        .run(credentials.as_ref(), args.supplied_principal.as_deref())
        .await
        .context("audit aborted")?;

    emit(&report, args.json, args.output.as_ref())
}

fn emit(report: &AuditReport, json: bool, output: Option<&PathBuf>) -> Result<()> {
    let rendered = if json {
        report.to_json().context("serializing report")?
    } else {
        report.render_text()
    };

    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_detect() {
        let cli = Cli::try_parse_from([
            "gpo-write-audit", "-v", "detect", "-d", "corp.local", "-u", "auditor", "-p", "pw",
            "-s", "CORP\\bob", "--json",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Detect(args) = cli.command;
        assert_eq!(args.domain.as_deref(), Some("corp.local"));
        assert_eq!(args.supplied_principal.as_deref(), Some("CORP\\bob"));
        assert!(args.json);
    }

    #[test]
    fn test_snapshot_conflicts_with_server() {
        let result = Cli::try_parse_from([
            "gpo-write-audit", "detect", "--snapshot", "s.json", "--server", "dc01",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::try_parse_from([
            "gpo-write-audit", "detect", "--snapshot", "s.json", "--max-concurrency", "9",
            "--ignore-deny",
        ])
        .unwrap();
        let Commands::Detect(args) = cli.command;
        let mut config = AuditConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.max_concurrency, 9);
        assert!(!config.honor_deny_aces);
    }
}
