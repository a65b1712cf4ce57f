//! ---
//! herald_section: "06-testing"
//! herald_subsection: "integration-tests"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Integration and validation tests for the Herald workspace."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use herald_common::config::{BrokerKind, HeraldConfig, OverflowPolicy};

fn root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}

fn read(path: &str) -> String {
    let full = root().join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == "target") {
                continue;
            }
            collect(&path, out);
        } else if path
            .extension()
            .is_some_and(|ext| ext == "rs" || ext == "toml")
        {
            out.push(path);
        }
    }
}

#[test]
fn example_configuration_is_valid() {
    let config: HeraldConfig = read("configs/herald.example.toml")
        .parse()
        .expect("example configuration must parse and validate");
    let ambassador = &config.ambassador;
    assert_eq!(ambassador.channel, "log_channel");
    assert_eq!(ambassador.failure_threshold, 5);
    assert_eq!(ambassador.reset_timeout, Duration::from_millis(60_000));
    assert_eq!(ambassador.max_retries, 3);
    assert_eq!(ambassador.overflow, OverflowPolicy::DropOldest);
    assert_eq!(ambassador.broker.kind, BrokerKind::Redis);
    assert_eq!(ambassador.broker.endpoint(), "localhost:6379");
    assert!(config.metrics.enabled);
}

#[test]
fn sources_and_manifests_carry_frontmatter() {
    let mut files = Vec::new();
    for dir in ["crates", "bin", "tests", "configs"] {
        collect(&root().join(dir), &mut files);
    }
    files.push(root().join("Cargo.toml"));
    assert!(files.len() > 10, "expected to find workspace sources");

    for file in files {
        let content = fs::read_to_string(&file).unwrap();
        let marker = if file.extension().is_some_and(|ext| ext == "rs") {
            "//! ---"
        } else {
            "# ---"
        };
        assert!(
            content.starts_with(marker),
            "{} must start with the frontmatter header",
            file.display()
        );
        assert!(
            content.contains("herald_description:"),
            "{} frontmatter must describe the file",
            file.display()
        );
    }
}
