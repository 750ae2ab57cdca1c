// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn atoms_arg() -> Arg {
    Arg::new("atoms")
        .required(true)
        .num_args(1..)
        .help("Package atoms")
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn disable_trigger_arg() -> Arg {
    Arg::new("disable-trigger")
        .long("disable-trigger")
        .value_name("TRIGGER")
        .action(ArgAction::Append)
        .help("Trigger to skip (repeatable)")
}

fn build_cli() -> Command {
    Command::new("equo")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Equo Contributors")
        .about("Binary package manager with multi-repository atom resolution")
        .subcommand_required(false)
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .global(true)
                .default_value("/var/lib/equo")
                .help("Directory holding the equo database, repositories and caches"),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .global(true)
                .default_value("/")
                .help("Install root directory"),
        )
        .subcommand(Command::new("init").about("Initialize the Equo database"))
        .subcommand(
            Command::new("repo-add")
                .about("Add a new repository")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(Arg::new("url").required(true).help("Repository URL"))
                .arg(
                    Arg::new("priority")
                        .short('p')
                        .long("priority")
                        .default_value("0")
                        .help("Priority (lower = consulted first)"),
                )
                .arg(flag("disabled", "Disable repository after adding")),
        )
        .subcommand(
            Command::new("repo-list")
                .about("List repositories")
                .arg(flag("all", "Show all repositories (including disabled)")),
        )
        .subcommand(
            Command::new("repo-remove")
                .about("Remove a repository")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("repo-enable")
                .about("Enable a repository")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("repo-disable")
                .about("Disable a repository")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("repo-sync")
                .about("Synchronize repository metadata")
                .arg(Arg::new("name").help("Repository name (syncs all enabled if omitted)"))
                .arg(flag("force", "Force sync even if metadata hasn't expired")),
        )
        .subcommand(
            Command::new("match")
                .about("Show the package an atom resolves to")
                .arg(Arg::new("atom").required(true))
                .arg(flag("installed", "Match installed packages instead of repositories"))
                .arg(flag("multi", "Show every candidate instead of the best one"))
                .arg(flag("all-repos", "With --multi, gather candidates from every repository"))
                .arg(flag("masked", "Consider masked packages")),
        )
        .subcommand(
            Command::new("search")
                .about("Search for packages in repositories")
                .arg(Arg::new("pattern").required(true)),
        )
        .subcommand(
            Command::new("deptree")
                .about("Show the dependency tree of an atom")
                .arg(Arg::new("atom").required(true))
                .arg(flag("empty", "Pull every dependency, satisfied or not"))
                .arg(flag("deep", "Also pull dependencies whose installed version or ABI differs")),
        )
        .subcommand(
            Command::new("install")
                .about("Install packages by atom or package file")
                .arg(atoms_arg())
                .arg(flag("nodeps", "Do not pull dependencies"))
                .arg(flag("empty", "Pull every dependency, satisfied or not"))
                .arg(flag("deep", "Also pull dependencies whose installed version or ABI differs"))
                .arg(flag("pretend", "Only show what would be done"))
                .arg(flag("fetch-only", "Download packages without installing them"))
                .arg(flag("no-checksum", "Skip checksum verification of downloaded packages"))
                .arg(disable_trigger_arg()),
        )
        .subcommand(
            Command::new("fetch")
                .about("Download packages and their dependencies without installing")
                .arg(atoms_arg())
                .arg(flag("nodeps", "Do not pull dependencies"))
                .arg(flag("no-checksum", "Skip checksum verification of downloaded packages")),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove installed packages")
                .arg(atoms_arg())
                .arg(flag("nodeps", "Do not remove packages depending on these"))
                .arg(flag("deep", "Also remove dependencies nothing else needs"))
                .arg(flag("pretend", "Only show what would be done"))
                .arg(flag("remove-config", "Also remove protected configuration files"))
                .arg(disable_trigger_arg()),
        )
        .subcommand(
            Command::new("query")
                .about("Query installed packages")
                .arg(Arg::new("pattern").help("Package key pattern (optional)")),
        )
        .subcommand(Command::new("cache-purge").about("Drop every cached resolution"))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell", "elvish"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("equo.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
