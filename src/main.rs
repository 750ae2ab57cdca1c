// src/main.rs

mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use commands::{InstallArgs, MatchArgs, RemoveArgs};
use equo::config::{Config, DEFAULT_DATA_DIR};
use equo::trigger::Trigger;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "equo")]
#[command(author, version, about = "Binary package manager with multi-repository atom resolution", long_about = None)]
struct Cli {
    /// Directory holding the equo database, repositories and caches
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Install root directory
    #[arg(short, long, global = true, default_value = "/")]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the Equo database
    Init,

    /// Add a new repository
    RepoAdd {
        /// Repository name
        name: String,
        /// Repository URL
        url: String,
        /// Priority (lower = consulted first)
        #[arg(short, long, default_value = "0")]
        priority: i32,
        /// Disable repository after adding
        #[arg(long)]
        disabled: bool,
    },

    /// List repositories
    RepoList {
        /// Show all repositories (including disabled)
        #[arg(short, long)]
        all: bool,
    },

    /// Remove a repository
    RepoRemove {
        name: String,
    },

    /// Enable a repository
    RepoEnable {
        name: String,
    },

    /// Disable a repository
    RepoDisable {
        name: String,
    },

    /// Synchronize repository metadata
    RepoSync {
        /// Repository name (syncs all enabled if omitted)
        name: Option<String>,
        /// Force sync even if metadata hasn't expired
        #[arg(short, long)]
        force: bool,
    },

    /// Show the package an atom resolves to
    Match {
        atom: String,
        /// Match installed packages instead of repositories
        #[arg(short, long)]
        installed: bool,
        /// Show every candidate instead of the best one
        #[arg(short, long)]
        multi: bool,
        /// With --multi, gather candidates from every repository
        #[arg(long)]
        all_repos: bool,
        /// Consider masked packages
        #[arg(long)]
        masked: bool,
    },

    /// Search for packages in repositories
    Search {
        pattern: String,
    },

    /// Show the dependency tree of an atom
    Deptree {
        atom: String,
        /// Pull every dependency, satisfied or not
        #[arg(short, long)]
        empty: bool,
        /// Also pull dependencies whose installed version or ABI differs
        #[arg(short, long)]
        deep: bool,
    },

    /// Install packages by atom or package file
    Install {
        #[arg(required = true)]
        atoms: Vec<String>,
        /// Do not pull dependencies
        #[arg(long)]
        nodeps: bool,
        /// Pull every dependency, satisfied or not
        #[arg(short, long)]
        empty: bool,
        /// Also pull dependencies whose installed version or ABI differs
        #[arg(short, long)]
        deep: bool,
        /// Only show what would be done
        #[arg(short, long)]
        pretend: bool,
        /// Download packages without installing them
        #[arg(long)]
        fetch_only: bool,
        /// Skip checksum verification of downloaded packages
        #[arg(long)]
        no_checksum: bool,
        /// Trigger to skip (repeatable)
        #[arg(long = "disable-trigger", value_name = "TRIGGER")]
        disabled_triggers: Vec<Trigger>,
    },

    /// Download packages and their dependencies without installing
    Fetch {
        #[arg(required = true)]
        atoms: Vec<String>,
        /// Do not pull dependencies
        #[arg(long)]
        nodeps: bool,
        /// Skip checksum verification of downloaded packages
        #[arg(long)]
        no_checksum: bool,
    },

    /// Remove installed packages
    Remove {
        #[arg(required = true)]
        atoms: Vec<String>,
        /// Do not remove packages depending on these
        #[arg(long)]
        nodeps: bool,
        /// Also remove dependencies nothing else needs
        #[arg(short, long)]
        deep: bool,
        /// Only show what would be done
        #[arg(short, long)]
        pretend: bool,
        /// Also remove protected configuration files
        #[arg(long)]
        remove_config: bool,
        /// Trigger to skip (repeatable)
        #[arg(long = "disable-trigger", value_name = "TRIGGER")]
        disabled_triggers: Vec<Trigger>,
    },

    /// Query installed packages
    Query {
        /// Package key pattern (shows all if omitted)
        pattern: Option<String>,
    },

    /// Drop every cached resolution
    CachePurge,

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::new(cli.data_dir, cli.root);

    let Some(command) = cli.command else {
        println!("Equo Package Manager v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'equo --help' for usage information");
        return Ok(());
    };

    match command {
        Commands::Init => commands::cmd_init(&config),
        Commands::RepoAdd {
            name,
            url,
            priority,
            disabled,
        } => commands::cmd_repo_add(&config, &name, &url, priority, disabled),
        Commands::RepoList { all } => commands::cmd_repo_list(&config, all),
        Commands::RepoRemove { name } => commands::cmd_repo_remove(&config, &name),
        Commands::RepoEnable { name } => commands::cmd_repo_set_enabled(&config, &name, true),
        Commands::RepoDisable { name } => commands::cmd_repo_set_enabled(&config, &name, false),
        Commands::RepoSync { name, force } => commands::cmd_repo_sync(&config, name.as_deref(), force),
        Commands::Match {
            atom,
            installed,
            multi,
            all_repos,
            masked,
        } => commands::cmd_match(
            &config,
            MatchArgs {
                atom: &atom,
                installed,
                multi,
                all_repos,
                masked,
            },
        ),
        Commands::Search { pattern } => commands::cmd_search(&config, &pattern),
        Commands::Deptree { atom, empty, deep } => commands::cmd_deptree(&config, &atom, empty, deep),
        Commands::Install {
            atoms,
            nodeps,
            empty,
            deep,
            pretend,
            fetch_only,
            no_checksum,
            disabled_triggers,
        } => commands::cmd_install(
            &config,
            InstallArgs {
                atoms: &atoms,
                nodeps,
                empty,
                deep,
                pretend,
                fetch_only,
                no_checksum,
                disabled_triggers: &disabled_triggers,
            },
        ),
        Commands::Fetch {
            atoms,
            nodeps,
            no_checksum,
        } => commands::cmd_install(
            &config,
            InstallArgs {
                atoms: &atoms,
                nodeps,
                empty: false,
                deep: false,
                pretend: false,
                fetch_only: true,
                no_checksum,
                disabled_triggers: &[],
            },
        ),
        Commands::Remove {
            atoms,
            nodeps,
            deep,
            pretend,
            remove_config,
            disabled_triggers,
        } => commands::cmd_remove(
            &config,
            RemoveArgs {
                atoms: &atoms,
                nodeps,
                deep,
                pretend,
                remove_config,
                disabled_triggers: &disabled_triggers,
            },
        ),
        Commands::Query { pattern } => commands::cmd_query(&config, pattern.as_deref()),
        Commands::CachePurge => commands::cmd_cache_purge(&config),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "equo", &mut std::io::stdout());
            Ok(())
        }
    }
}
