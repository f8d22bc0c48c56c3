extern crate flotilla;

mod common;
use common::{fixture, loader};

use flotilla::state::{LoadCtx, LoadOpts};

#[test]
fn env_file_glob_applies_in_sorted_order() {
    let state = loader(LoadOpts::default())
        .load(&fixture("envglob/helmfile.yaml"), &LoadCtx::default())
        .unwrap();
    let release = &state.releases[0];
    // env.2.yaml wins the namespace, env.1.yaml still supplies the owner
    assert_eq!(release.namespace, "second");
    assert_eq!(release.labels["owner"], "platform");
}

#[test]
fn base_environment_feeds_the_second_pass() {
    let state = loader(LoadOpts::default())
        .load(&fixture("twopass/helmfile.yaml"), &LoadCtx::default())
        .unwrap();
    assert_eq!(state.helmDefaults.kubeContext, "FOO");
    assert_eq!(state.releases[0].kubeContext, "FOO");
}

#[test]
fn missing_env_values_file_is_fatal_by_default() {
    let err = loader(LoadOpts::default())
        .load(&fixture("missing/error.yaml"), &LoadCtx::default())
        .unwrap_err();
    assert!(format!("{:?}", err).contains("no file matching \"nonexistent.*.yaml\" found"));
}

#[test]
fn missing_env_values_file_tolerated_with_warn() {
    let state = loader(LoadOpts::default())
        .load(&fixture("missing/warn.yaml"), &LoadCtx::default())
        .unwrap();
    assert_eq!(state.releases.len(), 1);
}

#[test]
fn load_errors_carry_the_file_path() {
    let err = loader(LoadOpts::default())
        .load(&fixture("missing/error.yaml"), &LoadCtx::default())
        .unwrap_err();
    assert!(err.to_string().contains("missing/error.yaml"));
}
