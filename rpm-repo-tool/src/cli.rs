// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    log::{info, warn, LevelFilter},
    rpm_repodata::{
        config::parse_bool,
        io::DigestAlgorithm,
        storage::filesystem::FilesystemStorage,
        NamingPolicy, RepositoryConfig, RpmRepository, RpmRepositoryError, UpdateSummary,
    },
    std::{str::FromStr, sync::Arc},
    thiserror::Error,
};

const CONFIG_ABOUT: &str = "\
# YAML Configuration

Repository settings can be read from a YAML file given with `--config`.
Command line flags override values from the file.

The YAML document can have the following keys:

digest (optional) (string)
   Digest algorithm of package checksums and of metadata file checksums.
   `sha1` or `sha256`. Defaults to `sha256`.

naming-policy (optional) (string)
   How published metadata files are named. `plain` publishes
   `repodata/primary.xml.gz`. `sha1` and `sha256` prefix the name with the
   digest of the compressed file, e.g. `repodata/<digest>-primary.xml.gz`.
   Defaults to `plain`.

filelists (optional) (bool)
   Whether to maintain `filelists.xml`. Defaults to `true`.
";

const UPDATE_ABOUT: &str = "\
Regenerate repository metadata from all stored packages.

Every `.rpm` file under the repository prefix is read, except files in the
`repodata` directory and in directories starting with `.`. Packages that
cannot be parsed are reported and left out of the metadata.
";

const UPDATE_INCREMENTAL_ABOUT: &str = "\
Update repository metadata with changed packages.

Only packages whose location is not indexed or whose content changed are
read. Indexed packages whose file no longer exists are removed from the
metadata. Nothing is published if nothing changed.

If no metadata exists yet, or the published metadata lacks a maintained
index, all metadata is regenerated.
";

const REMOVE_ABOUT: &str = "\
Remove packages from the repository.

Each key is a path relative to the repository prefix, as it appears in the
`location` of the package in `primary.xml`. The packages are removed from
the metadata, then their files are deleted.
";

#[derive(Debug, Error)]
pub enum RrtError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Repository(#[from] RpmRepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, RrtError>;

/// Resolve the repository configuration from an optional YAML file and flags.
fn resolve_config(args: &ArgMatches) -> Result<RepositoryConfig> {
    let mut config = if let Some(path) = args.value_of("config") {
        let f = std::fs::File::open(path)?;
        serde_yaml::from_reader(f)?
    } else {
        RepositoryConfig::default()
    };

    if let Some(value) = args.value_of("digest") {
        config.digest = DigestAlgorithm::from_str(value)?;
    }
    if let Some(value) = args.value_of("naming-policy") {
        config.naming_policy = NamingPolicy::from_str(value)?;
    }
    if args.is_present("no-filelists") {
        config.filelists = false;
    } else if let Some(value) = args.value_of("filelists") {
        config.filelists = parse_bool(value)?;
    }

    Ok(config)
}

fn repository(args: &ArgMatches) -> Result<RpmRepository> {
    let config = resolve_config(args)?;
    let path = args.value_of("path").unwrap_or(".");
    let prefix = args.value_of("prefix").unwrap_or_default();

    info!(
        "repository at {} (prefix '{}'); digest {}, naming {:?}, filelists {}",
        path,
        prefix,
        config.digest.xml_name(),
        config.naming_policy,
        config.filelists
    );

    let mut repo = RpmRepository::new(Arc::new(FilesystemStorage::new(path)), prefix, config);
    repo.set_max_parallel_io(args.value_of_t::<usize>("max-parallel-io")?);

    Ok(repo)
}

fn print_summary(summary: &UpdateSummary) {
    for location in &summary.added {
        println!("added {}", location);
    }
    for location in &summary.removed {
        println!("removed {}", location);
    }
    for (location, reason) in &summary.skipped {
        warn!("skipped {}: {}", location, reason);
    }
    for key in &summary.written {
        println!("wrote {}", key);
    }
    for key in &summary.deleted {
        println!("deleted {}", key);
    }

    if summary.written.is_empty() {
        println!("metadata unchanged; {} packages", summary.count);
    } else {
        println!("published metadata for {} packages", summary.count);
    }
}

async fn command_update(args: &ArgMatches) -> Result<()> {
    let summary = repository(args)?.batch_update().await?;
    print_summary(&summary);

    Ok(())
}

async fn command_update_incremental(args: &ArgMatches) -> Result<()> {
    let summary = repository(args)?.batch_update_incrementally().await?;
    print_summary(&summary);

    Ok(())
}

async fn command_remove(args: &ArgMatches) -> Result<()> {
    let keys = args
        .values_of("key")
        .map(|values| values.map(|v| v.to_string()).collect::<Vec<_>>())
        .unwrap_or_default();

    let summary = repository(args)?.remove_packages(&keys).await?;
    print_summary(&summary);

    Ok(())
}

fn app(default_threads: &str) -> Command<'_> {
    let app = Command::new("RPM Repository Tool")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Maintain RPM repository metadata")
        .after_long_help(CONFIG_ABOUT)
        .arg_required_else_help(true);

    let app = app
        .arg(
            Arg::new("path")
                .long("path")
                .takes_value(true)
                .default_value(".")
                .global(true)
                .help("Filesystem directory holding the repository"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .takes_value(true)
                .global(true)
                .help("Key prefix of the repository under --path"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .takes_value(true)
                .global(true)
                .help("YAML file defining repository settings"),
        )
        .arg(
            Arg::new("digest")
                .long("digest")
                .takes_value(true)
                .possible_values(["sha1", "sha256"])
                .global(true)
                .help("Digest algorithm of checksums"),
        )
        .arg(
            Arg::new("naming-policy")
                .long("naming-policy")
                .takes_value(true)
                .possible_values(["plain", "sha1", "sha256"])
                .global(true)
                .help("How published metadata files are named"),
        )
        .arg(
            Arg::new("no-filelists")
                .long("no-filelists")
                .global(true)
                .help("Do not maintain filelists.xml"),
        )
        .arg(
            Arg::new("filelists")
                .long("filelists")
                .takes_value(true)
                .possible_values(["true", "false"])
                .global(true)
                .conflicts_with("no-filelists")
                .help("Whether to maintain filelists.xml"),
        )
        .arg(
            Arg::new("max-parallel-io")
                .long("max-parallel-io")
                .takes_value(true)
                .default_value(default_threads)
                .global(true)
                .help("Maximum number of packages to read concurrently"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    app.subcommand(
        Command::new("update")
            .about("Regenerate metadata from all stored packages")
            .long_about(UPDATE_ABOUT),
    )
    .subcommand(
        Command::new("update-incremental")
            .about("Update metadata with changed packages")
            .long_about(UPDATE_INCREMENTAL_ABOUT),
    )
    .subcommand(
        Command::new("remove")
            .about("Remove packages from the repository")
            .long_about(REMOVE_ABOUT)
            .arg(
                Arg::new("key")
                    .required(true)
                    .multiple_values(true)
                    .help("Keys of packages to remove, relative to the prefix"),
            ),
    )
}

fn init_logging(matches: &ArgMatches) {
    let occurrences = match matches.subcommand() {
        Some((_, args)) => args.occurrences_of("verbose"),
        None => matches.occurrences_of("verbose"),
    };

    let log_level = match occurrences {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();
}

pub async fn run_cli() -> Result<()> {
    let default_threads = format!("{}", num_cpus::get());

    let mut app = app(&default_threads);
    let matches = app.clone().get_matches();

    init_logging(&matches);

    match matches.subcommand() {
        Some(("update", args)) => command_update(args).await,
        Some(("update-incremental", args)) => command_update_incremental(args).await,
        Some(("remove", args)) => command_remove(args).await,
        Some((command, _)) => Err(RrtError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn matches(args: &[&str]) -> Result<ArgMatches> {
        let matches = app("4").try_get_matches_from(args)?;

        Ok(matches
            .subcommand()
            .map(|(_, args)| args.clone())
            .unwrap_or(matches))
    }

    #[test]
    fn flags_override_defaults() -> Result<()> {
        let args = matches(&[
            "rrt",
            "update",
            "--digest",
            "sha1",
            "--naming-policy",
            "sha256",
            "--no-filelists",
        ])?;

        let config = resolve_config(&args)?;
        assert_eq!(config.digest, DigestAlgorithm::Sha1);
        assert_eq!(config.naming_policy, NamingPolicy::Sha256);
        assert!(!config.filelists);

        assert_eq!(args.value_of("path"), Some("."));
        assert_eq!(args.value_of_t::<usize>("max-parallel-io")?, 4);

        Ok(())
    }

    #[test]
    fn yaml_config() -> Result<()> {
        let config: RepositoryConfig =
            serde_yaml::from_str("digest: sha1\nnaming-policy: sha256\nfilelists: false\n")?;

        assert_eq!(config.digest, DigestAlgorithm::Sha1);
        assert_eq!(config.naming_policy, NamingPolicy::Sha256);
        assert!(!config.filelists);

        let config: RepositoryConfig = serde_yaml::from_str("{}")?;
        assert_eq!(config, RepositoryConfig::default());

        Ok(())
    }

    #[test]
    fn remove_keys() -> Result<()> {
        let args = matches(&["rrt", "remove", "a.rpm", "Packages/b.rpm", "--prefix", "el9"])?;

        assert_eq!(
            args.values_of("key").map(|v| v.collect::<Vec<_>>()),
            Some(vec!["a.rpm", "Packages/b.rpm"])
        );
        assert_eq!(args.value_of("prefix"), Some("el9"));

        assert!(app("4").try_get_matches_from(["rrt", "remove"]).is_err());

        Ok(())
    }
}
