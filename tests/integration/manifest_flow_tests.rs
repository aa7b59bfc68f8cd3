//! Integration tests for manifest generation through the module manager.
//!
//! Validates:
//! - Mods are resolved in order, followed by local scripts
//! - Duplicates across resolved and local mods are preserved
//! - Relative bot paths are kept, package bots reduce to their directory
//! - A resolution failure writes nothing
//! - Enable/disable changes are reflected in the next manifest

use std::fs;
use std::path::Path;

use server_launcher::models::manifest::Manifest;
use server_launcher::AppError;

use super::test_helpers::{test_config, test_manager, FakeScheduler, MapResolver};

fn read_manifest(path: &Path) -> Manifest {
    let raw = fs::read_to_string(path).expect("manifest exists");
    serde_json::from_str(&raw).expect("manifest is json")
}

#[tokio::test]
async fn manifest_lists_resolved_then_local_mods() {
    let temp = tempfile::tempdir().expect("tempdir");
    let local = temp.path().join("mods");
    fs::create_dir_all(local.join("nested")).expect("local mods dir");
    fs::write(local.join("b.js"), "").expect("write b.js");
    fs::write(local.join("a.js"), "").expect("write a.js");
    fs::write(local.join("notes.txt"), "").expect("write notes");
    fs::write(local.join("nested").join("deep.js"), "").expect("write nested");
    let dup = local.join("a.js").to_string_lossy().into_owned();

    let mut config = test_config(temp.path(), 1);
    config.mods = vec!["screepsmod-auth".to_owned(), "local-alias".to_owned()].into();
    let resolver = MapResolver::with_modules()
        .with("screepsmod-auth", "/srv/node_modules/screepsmod-auth/index.js")
        .with("local-alias", dup.clone());
    let manager = test_manager(config, &FakeScheduler::new(), resolver);

    manager.write_mods().await.expect("write mods");

    let manifest = read_manifest(&temp.path().join("mods.json"));
    assert_eq!(
        manifest.mods,
        vec![
            "/srv/node_modules/screepsmod-auth/index.js".to_owned(),
            dup.clone(),
            dup,
            local.join("b.js").to_string_lossy().into_owned(),
        ]
    );
}

#[tokio::test]
async fn bots_keep_relative_paths_and_reduce_packages_to_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path(), 1);
    config.bots.insert("local".into(), "./bots/simple".into());
    config.bots.insert("overmind".into(), "screeps-bot-overmind".into());
    let resolver = MapResolver::with_modules().with(
        "screeps-bot-overmind",
        "/srv/node_modules/screeps-bot-overmind/dist/main.js",
    );
    let manager = test_manager(config, &FakeScheduler::new(), resolver);

    manager.write_mods().await.expect("write mods");

    let manifest = read_manifest(&temp.path().join("mods.json"));
    assert_eq!(manifest.bots["local"], "./bots/simple");
    assert_eq!(
        manifest.bots["overmind"],
        "/srv/node_modules/screeps-bot-overmind/dist"
    );
    assert!(manifest.mods.is_empty());
}

#[tokio::test]
async fn missing_local_mods_directory_is_created() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(
        test_config(temp.path(), 1),
        &FakeScheduler::new(),
        MapResolver::with_modules(),
    );

    manager.write_mods().await.expect("write mods");

    assert!(temp.path().join("mods").is_dir());
}

#[tokio::test]
async fn unresolvable_mod_writes_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manifest_path = temp.path().join("mods.json");
    fs::write(&manifest_path, "previous").expect("seed manifest");
    let mut config = test_config(temp.path(), 1);
    config.mods = vec!["screepsmod-missing".to_owned()].into();
    let manager = test_manager(config, &FakeScheduler::new(), MapResolver::with_modules());

    let result = manager.write_mods().await;

    assert!(matches!(result, Err(AppError::Resolve(_))));
    assert_eq!(fs::read_to_string(&manifest_path).expect("read"), "previous");
}

#[tokio::test]
async fn unresolvable_bot_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path(), 1);
    config.bots.insert("ghost".into(), "screeps-bot-ghost".into());
    let manager = test_manager(config, &FakeScheduler::new(), MapResolver::with_modules());

    let result = manager.write_mods().await;

    assert!(matches!(result, Err(AppError::Resolve(_))));
    assert!(!temp.path().join("mods.json").exists());
}

#[tokio::test]
async fn manifest_reflects_enabled_mods() {
    let temp = tempfile::tempdir().expect("tempdir");
    let resolver = MapResolver::with_modules()
        .with("screepsmod-auth", "/srv/node_modules/screepsmod-auth/index.js")
        .with("screepsmod-admin", "/srv/node_modules/screepsmod-admin/index.js");
    let manager = test_manager(test_config(temp.path(), 1), &FakeScheduler::new(), resolver);

    manager.enable_mod("screepsmod-auth").await;
    manager.enable_mod("screepsmod-admin").await;
    manager.enable_mod("screepsmod-auth").await;
    manager.disable_mod("screepsmod-admin").await;
    manager.write_mods().await.expect("write mods");

    let manifest = read_manifest(&temp.path().join("mods.json"));
    assert_eq!(
        manifest.mods,
        vec!["/srv/node_modules/screepsmod-auth/index.js".to_owned()]
    );
}
