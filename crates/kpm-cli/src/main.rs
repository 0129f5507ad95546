//! kpm - package manager for the KCL configuration language.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::{Path, PathBuf};

use kpm_core::{
    Client, CompileOptions, Dependencies, Dependency, ModFile, Package, Source, MOD_FILE,
};

mod compiler;

use compiler::KclCompiler;

#[derive(Parser)]
#[command(name = "kpm")]
#[command(version)]
#[command(about = "Package manager for the KCL configuration language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new KCL package
    Init {
        /// Target directory (defaults to the current directory)
        path: Option<PathBuf>,
    },

    /// Add a dependency to kcl.mod and download it
    ///
    /// Supports multiple forms:
    /// - `kpm add k8s` - latest tag from the default registry
    /// - `kpm add k8s:1.27` - a pinned tag
    /// - `kpm add --git <url> --tag <ref>` - a git dependency
    /// - `kpm add --path ../helper` - a local dependency
    Add {
        /// Package reference, `<name>` or `<name>:<tag>`, or an `oci://` url
        package: Option<String>,

        /// Git repository url
        #[arg(long)]
        git: Option<String>,

        /// Git ref to use (requires --git)
        #[arg(long, requires = "git")]
        tag: Option<String>,

        /// Local path dependency
        #[arg(long, conflicts_with = "git")]
        path: Option<String>,
    },

    /// Re-resolve all dependencies and refresh the lock file
    Update,

    /// Package the current KCL package into a tar artifact
    Pkg {
        /// Vendor dependencies into the artifact
        #[arg(long)]
        vendor: bool,
    },

    /// Push the current package to an OCI registry
    Push {
        /// Target, an `oci://` url or `<name>[:<tag>]` reference
        source: Option<String>,

        /// Artifact tag (defaults to the package version)
        #[arg(long)]
        tag: Option<String>,

        /// Vendor dependencies before packaging
        #[arg(long)]
        vendor: bool,
    },

    /// Pull a package from an OCI registry
    Pull {
        /// Source, an `oci://` url or `<name>[:<tag>]` reference
        source: String,

        /// Artifact tag
        #[arg(long)]
        tag: Option<String>,

        /// Directory to unpack into (defaults to the current directory)
        target: Option<PathBuf>,
    },

    /// Log in to an OCI registry
    Login {
        /// Registry hostname
        registry: String,

        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: String,
    },

    /// Log out from an OCI registry
    Logout {
        /// Registry hostname
        registry: String,
    },

    /// Compile the current package with its resolved dependencies
    Run {
        /// Entry files (defaults to the manifest profile)
        entries: Vec<String>,

        /// Package root
        #[arg(long, default_value = ".")]
        pkg_path: PathBuf,

        /// Resolve dependencies into the project-local vendor tree
        #[arg(long)]
        vendor: bool,

        /// Compile from a tar artifact instead of a package directory
        #[arg(long, conflicts_with = "oci")]
        tar: Option<PathBuf>,

        /// Compile from an OCI reference instead of a package directory
        #[arg(long)]
        oci: Option<String>,

        /// Tag for --oci
        #[arg(long, requires = "oci")]
        tag: Option<String>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        command => {
            let client = Client::new().context("failed to set up the kpm client")?;
            dispatch(&client, command)
        }
    }
}

fn dispatch(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Init { path } => init(client, path),
        Commands::Add {
            package,
            git,
            tag,
            path,
        } => add(client, package, git, tag, path),
        Commands::Update => update(client),
        Commands::Pkg { vendor } => pkg(client, vendor),
        Commands::Push {
            source,
            tag,
            vendor,
        } => push(client, source, tag, vendor),
        Commands::Pull {
            source,
            tag,
            target,
        } => pull(client, &source, tag, target),
        Commands::Login {
            registry,
            username,
            password,
        } => {
            client.login(&registry, &username, &password)?;
            println!("Logged in to {registry}");
            Ok(())
        }
        Commands::Logout { registry } => {
            client.logout(&registry)?;
            println!("Logged out from {registry}");
            Ok(())
        }
        Commands::Run {
            entries,
            pkg_path,
            vendor,
            tar,
            oci,
            tag,
        } => run(client, entries, pkg_path, vendor, tar, oci, tag),
        Commands::Completions { .. } => unreachable!("completions are handled before client setup"),
    }
}

fn init(client: &Client, path: Option<PathBuf>) -> Result<()> {
    let home = match path {
        Some(path) => {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("failed to create '{}'", path.display()))?;
            path
        }
        None => std::env::current_dir()?,
    };

    let name = package_name_from_dir(&home)?;
    let pkg = Package::new(ModFile::new(name.as_str(), &home), Dependencies::default(), &home);
    client.init_empty_pkg(&pkg)?;
    println!("Initialized package `{name}`");
    Ok(())
}

fn add(
    client: &Client,
    package: Option<String>,
    git: Option<String>,
    tag: Option<String>,
    path: Option<String>,
) -> Result<()> {
    let mut pkg = load_current_package(client)?;

    let dep = if let Some(path) = path {
        let name = Path::new(&path)
            .file_name()
            .and_then(|name| name.to_str())
            .context("cannot derive a dependency name from the path")?
            .to_string();
        Dependency::new(name, "", Source::Local { path: path.into() })
    } else if let Some(url) = git {
        let tag = tag.unwrap_or_default();
        let name = repo_name_from_git_url(&url);
        Dependency::new(name, tag.clone(), Source::Git { url, tag })
    } else if let Some(reference) = package {
        let opts = client.parse_oci_option(&reference, "")?;
        let name = opts
            .repo
            .rsplit('/')
            .next()
            .unwrap_or(opts.repo.as_str())
            .to_string();
        Dependency::new(
            name,
            opts.tag.clone(),
            Source::Oci {
                reg: opts.reg,
                repo: opts.repo,
                tag: opts.tag,
            },
        )
    } else {
        bail!("specify a package reference, --git, or --path");
    };

    client.add_dep(&mut pkg, dep)?;
    Ok(())
}

fn update(client: &Client) -> Result<()> {
    let mut pkg = load_current_package(client)?;
    client.update_deps(&mut pkg)?;
    println!("Updated {}", kpm_core::LOCK_FILE);
    Ok(())
}

fn pkg(client: &Client, vendor: bool) -> Result<()> {
    let mut pkg = load_current_package(client)?;
    let tar_path = client.package_pkg(&mut pkg, vendor)?;
    println!("Packaged into {}", tar_path.display());
    Ok(())
}

fn push(client: &Client, source: Option<String>, tag: Option<String>, vendor: bool) -> Result<()> {
    let mut pkg = load_current_package(client)?;

    let opts = match source {
        Some(source) => client.parse_oci_option(&source, tag.as_deref().unwrap_or(""))?,
        None => {
            // Without an explicit target, push under the default registry
            // namespace as `<name>:<version>`.
            let name = pkg.mod_file.package.name.clone();
            client.parse_oci_option(&name, tag.as_deref().unwrap_or(""))?
        }
    };

    client.push(&mut pkg, &opts, vendor)?;
    println!("Pushed {}:{}", opts.repo, pkg.mod_file.package.version);
    Ok(())
}

fn pull(client: &Client, source: &str, tag: Option<String>, target: Option<PathBuf>) -> Result<()> {
    let target = match target {
        Some(target) => target,
        None => std::env::current_dir()?,
    };
    client.pull(&target, source, tag.as_deref().unwrap_or(""))?;
    Ok(())
}

fn run(
    client: &Client,
    entries: Vec<String>,
    pkg_path: PathBuf,
    vendor: bool,
    tar: Option<PathBuf>,
    oci: Option<String>,
    tag: Option<String>,
) -> Result<()> {
    let opts = CompileOptions::new(pkg_path)
        .with_entries(entries)
        .with_vendor(vendor);

    let output = if let Some(tar_path) = tar {
        client.compile_tar_pkg(&tar_path, &opts, &KclCompiler)?
    } else if let Some(source) = oci {
        client.compile_oci_pkg(&source, tag.as_deref().unwrap_or(""), &opts, &KclCompiler)?
    } else {
        client.compile_with_opts(&opts, &KclCompiler)?
    };

    print!("{output}");
    Ok(())
}

fn load_current_package(client: &Client) -> Result<Package> {
    let cwd = std::env::current_dir()?;
    if !cwd.join(MOD_FILE).exists() {
        bail!("no {MOD_FILE} found in the current directory; run `kpm init` first");
    }
    client
        .load_package(&cwd)
        .context("failed to load the current package")
}

fn package_name_from_dir(dir: &Path) -> Result<String> {
    dir.canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf())
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .context("cannot infer a package name from the directory")
}

/// The repo name in `https://github.com/xxx/kcl1.git` is `kcl1`.
fn repo_name_from_git_url(url: &str) -> String {
    let base = url.rsplit('/').next().unwrap_or(url);
    base.strip_suffix(".git").unwrap_or(base).to_string()
}
