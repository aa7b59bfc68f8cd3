use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use server_launcher::config::ModsSet;
use server_launcher::manifest::{build_manifest, write_manifest};
use server_launcher::models::manifest::Manifest;
use server_launcher::resolver::{NodePackageResolver, PackageResolver};

#[tokio::test]
async fn builds_from_node_modules_tree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pkg = temp.path().join("node_modules").join("screepsmod-auth");
    fs::create_dir_all(&pkg).expect("mkdir");
    fs::write(pkg.join("package.json"), r#"{"main":"index.js"}"#).expect("package.json");
    fs::write(pkg.join("index.js"), "").expect("index.js");
    let local = temp.path().join("mods");
    fs::create_dir_all(&local).expect("local");
    fs::write(local.join("tweaks.js"), "").expect("tweaks.js");
    fs::write(local.join("readme.md"), "").expect("readme.md");

    let mods = ModsSet::from(vec!["screepsmod-auth".to_owned()]);
    let bots = BTreeMap::from([("simple".to_owned(), "./bots/simple".to_owned())]);
    let resolver: Arc<dyn PackageResolver> = Arc::new(NodePackageResolver::new(temp.path()));

    let manifest = build_manifest(&mods, &bots, Some(&local), &resolver)
        .await
        .expect("build");

    assert_eq!(manifest.mods.len(), 2);
    assert!(manifest.mods[0].ends_with("screepsmod-auth/index.js"));
    assert!(manifest.mods[1].ends_with("mods/tweaks.js"));
    assert_eq!(manifest.bots["simple"], "./bots/simple");
}

#[tokio::test]
async fn no_local_mods_directory_skips_scan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let resolver: Arc<dyn PackageResolver> = Arc::new(NodePackageResolver::new(temp.path()));

    let manifest = build_manifest(&ModsSet::default(), &BTreeMap::new(), None, &resolver)
        .await
        .expect("build");

    assert_eq!(manifest, Manifest::default());
}

#[tokio::test]
async fn write_replaces_previous_manifest() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("mods.json");
    fs::write(&path, "{\"mods\": [\"stale\"], \"bots\": {}, \"extra\": true}").expect("seed");

    let manifest = Manifest {
        mods: vec!["/srv/mods/a.js".to_owned()],
        bots: BTreeMap::from([("bot".to_owned(), "/srv/bots/bot".to_owned())]),
    };
    write_manifest(&path, &manifest).await.expect("write");

    let raw = fs::read_to_string(&path).expect("read");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(
        value,
        serde_json::json!({ "mods": ["/srv/mods/a.js"], "bots": { "bot": "/srv/bots/bot" } })
    );
}
