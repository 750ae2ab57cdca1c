// src/commands.rs

//! Command implementations for the equo CLI

use anyhow::{Result, anyhow};
use equo::cache::ResultCache;
use equo::config::Config;
use equo::db::models::{Package, Repository};
use equo::db::{self, PackageDatabase, SqlitePackageDb};
use equo::repository::{self, HttpFetcher, RepositoryHandle, RepositorySet};
use equo::resolver::{
    INSTALLED_REPOSITORY, InstallQueue, Match, MatchOptions, Resolver, TreeStatus,
};
use equo::transaction::{Action, LogProgress, PackageTransaction, PidLock, PrepareOptions};
use equo::trigger::Trigger;
use std::path::Path;
use tracing::info;

/// Everything a command needs from the system database
struct System {
    config: Config,
    conn: rusqlite::Connection,
    installed: SqlitePackageDb,
    cache: ResultCache,
}

impl System {
    fn open(config: Config) -> Result<Self> {
        let conn = db::open(&config.db_path_str())?;
        let installed = SqlitePackageDb::open(&config.db_path_str(), INSTALLED_REPOSITORY)?;
        let cache = ResultCache::with_root(&config.cache_dir);
        Ok(Self {
            config,
            conn,
            installed,
            cache,
        })
    }

    fn repositories(&self) -> Result<RepositorySet> {
        Ok(RepositorySet::from_registry(&self.conn, &self.config.repos_dir)?)
    }
}

/// Initialize the database and the data directory layout
pub fn cmd_init(config: &Config) -> Result<()> {
    info!("Initializing Equo database at: {}", config.db_path.display());
    db::init(&config.db_path_str())?;
    for dir in [
        &config.repos_dir,
        &config.cache_dir,
        &config.packages_dir,
        &config.unpack_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }
    println!("Database initialized successfully at: {}", config.db_path.display());
    Ok(())
}

pub fn cmd_repo_add(config: &Config, name: &str, url: &str, priority: i32, disabled: bool) -> Result<()> {
    let conn = db::open(&config.db_path_str())?;
    let repo = repository::add_repository(&conn, name.to_string(), url.to_string(), !disabled, priority)?;
    println!("Added repository: {}", repo.name);
    println!("  URL: {}", repo.url);
    println!("  Enabled: {}", repo.enabled);
    println!("  Priority: {}", repo.priority);
    Ok(())
}

/// List repositories in priority order
pub fn cmd_repo_list(config: &Config, all: bool) -> Result<()> {
    let conn = db::open(&config.db_path_str())?;
    let repos = if all {
        Repository::list_all(&conn)?
    } else {
        Repository::list_enabled(&conn)?
    };

    if repos.is_empty() {
        println!("No repositories configured");
        return Ok(());
    }

    println!("Repositories:");
    for repo in repos {
        let enabled_mark = if repo.enabled { "[x]" } else { "[ ]" };
        let sync_status = repo
            .last_sync
            .as_ref()
            .map(|ts| format!("synced {}", ts))
            .unwrap_or_else(|| "never synced".to_string());
        println!(
            "  {} {} (priority: {}, {})",
            enabled_mark, repo.name, repo.priority, sync_status
        );
        println!("      {}", repo.url);
    }
    Ok(())
}

pub fn cmd_repo_remove(config: &Config, name: &str) -> Result<()> {
    let conn = db::open(&config.db_path_str())?;
    repository::remove_repository(&conn, name, &config.repos_dir)?;
    ResultCache::with_root(&config.cache_dir).purge_repository(name);
    println!("Removed repository: {}", name);
    Ok(())
}

pub fn cmd_repo_set_enabled(config: &Config, name: &str, enabled: bool) -> Result<()> {
    let conn = db::open(&config.db_path_str())?;
    repository::set_repository_enabled(&conn, name, enabled)?;
    ResultCache::with_root(&config.cache_dir).purge_repository(name);
    println!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Synchronize one repository, or every enabled one
pub fn cmd_repo_sync(config: &Config, name: Option<&str>, force: bool) -> Result<()> {
    let conn = db::open(&config.db_path_str())?;
    let repos = match name {
        Some(name) => vec![
            Repository::find_by_name(&conn, name)?
                .ok_or_else(|| anyhow!("Repository '{}' not found", name))?,
        ],
        None => Repository::list_enabled(&conn)?,
    };

    let cache = ResultCache::with_root(&config.cache_dir);
    for mut repo in repos {
        if !force && !repository::needs_sync(&repo) {
            println!("{}: up to date", repo.name);
            continue;
        }
        match repository::sync_repository(&conn, &mut repo, &config.repos_dir) {
            Ok(count) => {
                cache.purge_repository(&repo.name);
                println!("{}: synchronized {} packages", repo.name, count);
            }
            Err(e) => println!("{}: sync failed: {}", repo.name, e),
        }
    }
    Ok(())
}

pub struct MatchArgs<'a> {
    pub atom: &'a str,
    pub installed: bool,
    pub multi: bool,
    pub all_repos: bool,
    pub masked: bool,
}

/// Resolve an atom and print what it matches
pub fn cmd_match(config: &Config, args: MatchArgs<'_>) -> Result<()> {
    let system = System::open(config.clone())?;
    let repos = system.repositories()?;
    let resolver = Resolver::new(&repos, &system.installed, &system.cache);

    let options = MatchOptions {
        allow_masked: args.masked,
        multi_match: args.multi,
        multi_repo: args.all_repos,
        ..MatchOptions::default()
    };
    let result = if args.installed {
        resolver.match_installed(args.atom, &options)?
    } else {
        resolver.atom_match(args.atom, &options)?
    };

    let matches = result.into_matches();
    if matches.is_empty() {
        return Err(anyhow!("No package matches '{}'", args.atom));
    }
    for m in &matches {
        println!("{} [{}]", resolver.atom_string(m)?, m.repository);
    }
    report_unavailable(&resolver);
    Ok(())
}

/// Search repository packages by key substring
pub fn cmd_search(config: &Config, pattern: &str) -> Result<()> {
    let system = System::open(config.clone())?;
    let repos = system.repositories()?;
    let results = repository::search_packages(&repos, pattern)?;

    if results.is_empty() {
        println!("No packages found matching '{}'", pattern);
        return Ok(());
    }
    for (repo, pkg) in &results {
        print_package(pkg, Some(repo));
    }
    println!("\nTotal: {} package(s)", results.len());
    Ok(())
}

/// Print the leveled dependency tree of an atom
pub fn cmd_deptree(config: &Config, atom: &str, empty: bool, deep: bool) -> Result<()> {
    let system = System::open(config.clone())?;
    let repos = system.repositories()?;
    let resolver = Resolver::new(&repos, &system.installed, &system.cache);

    let root = resolver.atom_match(atom, &MatchOptions::default())?.require(atom)?;
    let tree = resolver.build_tree(&root, empty, deep, None)?;

    if let TreeStatus::Unresolved(missing) = &tree.status {
        return Err(anyhow!("Unresolved dependencies: {}", missing.join(", ")));
    }
    for (level, matches) in &tree.levels {
        for m in matches {
            println!("{}{} [{}]", "  ".repeat(*level as usize - 1), resolver.atom_string(m)?, m.repository);
        }
    }
    if !tree.conflicts.is_empty() {
        println!("Conflicting installed packages:");
        for id in &tree.conflicts {
            print_package(&resolver.package(&Match::installed(*id))?, None);
        }
    }
    Ok(())
}

pub struct InstallArgs<'a> {
    pub atoms: &'a [String],
    pub nodeps: bool,
    pub empty: bool,
    pub deep: bool,
    pub pretend: bool,
    pub fetch_only: bool,
    pub no_checksum: bool,
    pub disabled_triggers: &'a [Trigger],
}

/// Resolve, fetch and install packages
///
/// Arguments naming an existing file are installed from that package file.
pub fn cmd_install(config: &Config, args: InstallArgs<'_>) -> Result<()> {
    let system = System::open(config.clone())?;
    let _lock = PidLock::acquire(&system.config.lock_path)?;

    let mut repos = system.repositories()?;
    let mut requested = Vec::new();
    for arg in args.atoms {
        let path = Path::new(arg);
        if path.is_file() {
            let handle = RepositoryHandle::package_file(path)?;
            let pkg = Package::list_all(handle.database()?.connection())?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("{} holds no package", arg))?;
            requested.push((pkg.atom(), Some(handle.name.clone())));
            repos.push(handle);
        } else {
            requested.push((arg.clone(), None));
        }
    }

    let resolver = Resolver::new(&repos, &system.installed, &system.cache);
    let mut matches = Vec::new();
    for (atom, repository) in &requested {
        let options = MatchOptions {
            repositories: repository.clone().map(|name| vec![name]),
            ..MatchOptions::default()
        };
        matches.push(resolver.atom_match(atom, &options)?.require(atom)?);
    }

    let queue = if args.nodeps {
        InstallQueue {
            install: matches,
            remove: Vec::new(),
            status: TreeStatus::Ok,
        }
    } else {
        resolver.install_queue(&matches, args.empty, args.deep)?.into_result()?
    };
    report_unavailable(&resolver);

    if queue.install.is_empty() {
        println!("Nothing to install");
        return Ok(());
    }
    for id in &queue.remove {
        println!("  [remove]  {}", resolver.atom_string(&Match::installed(*id))?);
    }
    for m in &queue.install {
        println!("  [install] {} [{}]", resolver.atom_string(m)?, m.repository);
    }
    if args.pretend {
        return Ok(());
    }

    let fetcher = HttpFetcher::new()?;
    let progress = LogProgress;
    let options = PrepareOptions {
        remove_config: false,
        do_checksum: !args.no_checksum,
    };
    let new_transaction = || {
        PackageTransaction::new(&repos, &system.installed, &system.config, &fetcher)
            .with_progress(&progress)
            .with_cache(&system.cache)
            .with_disabled_triggers(args.disabled_triggers.iter().copied())
    };
    let execute = |action: Action| -> Result<()> {
        let mut tx = new_transaction();
        tx.prepare(action, options)?;
        let result = tx.run();
        tx.kill();
        Ok(result?)
    };

    for m in &queue.install {
        execute(Action::Fetch(m.clone()))?;
    }
    if args.fetch_only {
        println!("Fetched {} package(s)", queue.install.len());
        return Ok(());
    }

    for id in &queue.remove {
        execute(Action::Remove(*id))?;
    }
    for m in &queue.install {
        execute(Action::Install(m.clone()))?;
    }
    println!("Installed {} package(s)", queue.install.len());
    Ok(())
}

pub struct RemoveArgs<'a> {
    pub atoms: &'a [String],
    pub nodeps: bool,
    pub deep: bool,
    pub pretend: bool,
    pub remove_config: bool,
    pub disabled_triggers: &'a [Trigger],
}

/// Remove installed packages and, unless `nodeps`, what depends on them
pub fn cmd_remove(config: &Config, args: RemoveArgs<'_>) -> Result<()> {
    let system = System::open(config.clone())?;
    let _lock = PidLock::acquire(&system.config.lock_path)?;

    let repos = system.repositories()?;
    let resolver = Resolver::new(&repos, &system.installed, &system.cache);

    let mut ids = Vec::new();
    for atom in args.atoms {
        let m = resolver
            .match_installed(atom, &MatchOptions::default())?
            .require(atom)?;
        if system.installed.is_protected_system_package(m.package_id)? {
            return Err(equo::Error::SystemPackage(atom.clone()).into());
        }
        ids.push(m.package_id);
    }

    let queue = if args.nodeps {
        ids
    } else {
        resolver.removal_queue(&ids, args.deep)?
    };
    for id in &queue {
        println!("  [remove] {}", resolver.atom_string(&Match::installed(*id))?);
    }
    if args.pretend {
        return Ok(());
    }

    let fetcher = HttpFetcher::new()?;
    let progress = LogProgress;
    let options = PrepareOptions {
        remove_config: args.remove_config,
        do_checksum: false,
    };
    for id in &queue {
        let mut tx = PackageTransaction::new(&repos, &system.installed, &system.config, &fetcher)
            .with_progress(&progress)
            .with_cache(&system.cache)
            .with_disabled_triggers(args.disabled_triggers.iter().copied());
        tx.prepare(Action::Remove(*id), options)?;
        let result = tx.run();
        tx.kill();
        result?;
    }
    println!("Removed {} package(s)", queue.len());
    Ok(())
}

/// List installed packages
pub fn cmd_query(config: &Config, pattern: Option<&str>) -> Result<()> {
    let system = System::open(config.clone())?;
    let conn = system.installed.connection();
    let packages = match pattern {
        Some(pattern) => Package::search(conn, pattern)?,
        None => Package::list_all(conn)?,
    };

    if packages.is_empty() {
        println!("No packages found.");
        return Ok(());
    }
    println!("Installed packages:");
    for pkg in &packages {
        print_package(pkg, pkg.origin_repository.as_deref());
    }
    println!("\nTotal: {} package(s)", packages.len());
    Ok(())
}

pub fn cmd_cache_purge(config: &Config) -> Result<()> {
    let cache = ResultCache::with_root(&config.cache_dir);
    let before = cache.stats();
    cache.purge();
    println!("Purged resolver cache ({} entries)", before.entries);
    Ok(())
}

fn print_package(pkg: &Package, repository: Option<&str>) {
    print!("  {}", pkg.atom());
    if pkg.slot != "0" {
        print!(":{}", pkg.slot);
    }
    if let Some(repository) = repository {
        print!(" [{}]", repository);
    }
    if pkg.masked {
        print!(" (masked)");
    }
    println!();
}

fn report_unavailable(resolver: &Resolver<'_>) {
    for name in resolver.unavailable() {
        eprintln!("warning: repository {} is unavailable", name);
    }
}
