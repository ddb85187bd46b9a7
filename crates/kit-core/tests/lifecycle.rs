//! End-to-end: resolve, install, list, reconcile and uninstall against local
//! and HTTP-served manifests and artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kit_core::autoversion::AutoVersion;
use kit_core::cache::{Cache, CacheOptions, DefaultFetcher};
use kit_core::envars::Envars;
use kit_core::install::Installer;
use kit_core::manifest::Platform;
use kit_core::resolver::{PackageState, Resolver};
use kit_core::sources::Sources;
use kit_core::state::StateStore;
use kit_core::{Config, Paths};
use kit_schema::{Reference, Selector};
use sha2::{Digest, Sha256};

fn tar_gz(top: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{top}/{path}"), *body)
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

struct Kit {
    paths: Paths,
    resolver: Resolver,
    installer: Installer,
}

impl Kit {
    fn open(home: &Path, uris: Vec<String>) -> Self {
        let paths = Paths::new(home);
        paths.ensure().unwrap();
        let config = Config {
            sources: uris,
            ..Config::default()
        };
        let client = reqwest::Client::new();

        let cache = Cache::open(
            paths.cache_path(),
            Arc::new(DefaultFetcher::new(client.clone())),
            CacheOptions {
                lock_timeout: config.lock_timeout(),
            },
        )
        .unwrap();
        let resolver = Resolver::new(
            Sources::from_config(&config, &paths, &client).unwrap(),
            AutoVersion::with_defaults(client),
            Platform::new("linux", "amd64"),
            Envars::parse(["PATH=/usr/bin", "HOME=/home/u"]),
            paths.pkg_path(),
        )
        .with_cache(cache.clone());
        let state = StateStore::open(&paths.db_path()).unwrap();
        let installer = Installer::new(cache, state, paths.clone());
        Self {
            paths,
            resolver,
            installer,
        }
    }

    fn state(&self) -> &StateStore {
        self.installer.state()
    }
}

fn write_manifest(dir: &Path, name: &str, text: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{name}.toml")), text).unwrap();
}

#[tokio::test]
async fn test_local_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let artifacts = tmp.path().join("artifacts");
    std::fs::create_dir_all(&artifacts).unwrap();
    let bytes = tar_gz("greet-2.1.0", &[("bin/greet", b"#!/bin/sh\necho hello\n")]);
    std::fs::write(artifacts.join("greet-2.1.0.tar.gz"), &bytes).unwrap();

    let manifests = tmp.path().join("manifests");
    write_manifest(
        &manifests,
        "greet",
        &format!(
            r#"
description = "Prints a greeting"
homepage = "https://example.com/greet"
source = "file://{}/greet-${{version}}.tar.gz"
strip = 1
binaries = ["bin/*"]
provides = ["greet"]

[[env]]
name = "PATH"
prepend = "${{root}}/bin"

[[env]]
name = "GREET_HOME"
set = "${{root}}"

[[version]]
versions = ["2.0.0", "2.1.0"]
"#,
            artifacts.display()
        ),
    );

    let kit = Kit::open(&tmp.path().join("home"), vec![format!("dir:{}", manifests.display())]);
    let selector = Selector::parse("greet").unwrap();

    let pkg = kit.resolver.resolve(&selector, &[]).await.unwrap();
    assert_eq!(pkg.reference, Reference::version("greet", "2.1.0"));
    assert_eq!(pkg.state, PackageState::NotInstalled);
    assert_eq!(pkg.origin, format!("dir:{}", manifests.display()));
    let root = kit.paths.pkg_path().join("greet-2.1.0");
    assert_eq!(pkg.root, root);
    assert_eq!(
        pkg.environment.changed(false),
        vec![
            ("PATH".to_string(), format!("{}/bin:/usr/bin", root.display())),
            ("GREET_HOME".to_string(), root.display().to_string()),
        ]
    );

    let record = kit.installer.install(&pkg).await.unwrap();
    assert_eq!(
        record.checksum.as_ref().map(|d| d.as_str().to_string()),
        Some(hex::encode(Sha256::digest(&bytes)))
    );
    assert!(root.join("bin/greet").is_file());

    let installed = kit.state().list_installed().await.unwrap();
    assert_eq!(installed, vec![record.clone()]);
    assert!(kit.state().reconcile(&kit.paths.pkg_path()).await.unwrap().is_clean());

    // Answered from the state store alone, even with the manifest gone.
    std::fs::remove_file(manifests.join("greet.toml")).unwrap();
    let again = kit.resolver.resolve(&selector, &installed).await.unwrap();
    assert_eq!(again.state, PackageState::Installed);
    assert_eq!(again.description, "Prints a greeting");
    assert_eq!(again.environment, pkg.environment);
    assert_eq!(again.resolve_binaries(), vec![root.join("bin/greet")]);

    let removed = kit.installer.uninstall(&pkg.reference).await.unwrap();
    assert_eq!(removed.reference, pkg.reference);
    assert!(!root.exists());
    assert!(kit.state().list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_out_of_band_deletion_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let artifact = tmp.path().join("tool.tar.gz");
    std::fs::write(&artifact, tar_gz("tool", &[("tool", b"x")])).unwrap();
    let manifests = tmp.path().join("manifests");
    write_manifest(
        &manifests,
        "tool",
        &format!(
            "source = \"file://{}\"\nstrip = 1\n\n[[version]]\nversions = [\"1.0.0\"]\n",
            artifact.display()
        ),
    );

    let kit = Kit::open(&tmp.path().join("home"), vec![format!("dir:{}", manifests.display())]);
    let selector = Selector::parse("tool-1.0.0").unwrap();
    let record = kit
        .installer
        .ensure(&kit.resolver, &selector, Duration::from_secs(30))
        .await
        .unwrap();

    // Deleted behind kit's back.
    std::fs::remove_dir_all(&record.install_path).unwrap();
    std::fs::create_dir_all(kit.paths.pkg_path().join("stray")).unwrap();

    let report = kit.state().reconcile(&kit.paths.pkg_path()).await.unwrap();
    assert_eq!(report.orphaned, vec![record.clone()]);
    assert_eq!(report.untracked, vec![kit.paths.pkg_path().join("stray")]);
    assert!(report.inconsistencies()[0].to_string().contains("tool-1.0.0"));

    let all = kit.state().list_all().await.unwrap();
    let pkg = kit.resolver.resolve(&selector, &all).await.unwrap();
    assert_eq!(pkg.state, PackageState::Corrupt);

    assert_eq!(
        kit.state().prune_orphans().await.unwrap(),
        vec![record.reference.clone()]
    );

    // A fresh install repairs it.
    let repaired = kit.installer.install(&pkg).await.unwrap();
    assert!(repaired.install_path.join("tool").is_file());
}

#[tokio::test]
async fn test_remote_repository_and_http_artifact() {
    let mut server = mockito::Server::new_async().await;
    let bytes = tar_gz("rg", &[("rg", b"\x7fELF")]);
    let digest = hex::encode(Sha256::digest(&bytes));
    let artifact_url = format!("{}/dl/rg-14.1.0.tar.gz", server.url());

    let index = server
        .mock("GET", "/repo/index.json")
        .with_body(r#"["rg"]"#)
        .create_async()
        .await;
    let manifest = server
        .mock("GET", "/repo/rg.toml")
        .with_body(format!(
            "source = \"{}/dl/rg-${{version}}.tar.gz\"\nstrip = 1\nbinaries = [\"rg\"]\n\n[[version]]\nversions = [\"14.1.0\"]\n\n[sha256sums]\n\"{artifact_url}\" = \"{digest}\"\n",
            server.url()
        ))
        .expect_at_least(1)
        .create_async()
        .await;
    let download = server
        .mock("GET", "/dl/rg-14.1.0.tar.gz")
        .with_body(bytes.clone())
        .expect(1)
        .create_async()
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let kit = Kit::open(&tmp.path().join("home"), vec![format!("{}/repo", server.url())]);

    // Glob selectors enumerate the repository index.
    let pkg = kit
        .resolver
        .resolve(&Selector::parse("r*").unwrap(), &[])
        .await
        .unwrap();
    assert_eq!(pkg.reference, Reference::version("rg", "14.1.0"));
    assert_eq!(pkg.checksum.as_ref().map(|d| d.as_str()), Some(digest.as_str()));

    let (a, b) = tokio::join!(kit.installer.install(&pkg), kit.installer.install(&pkg));
    assert_eq!(a.unwrap(), b.unwrap());
    let binaries: Vec<PathBuf> = pkg.resolve_binaries();
    assert_eq!(binaries, vec![pkg.root.join("rg")]);

    index.assert_async().await;
    manifest.assert_async().await;
    download.assert_async().await;
}
