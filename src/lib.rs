#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]
#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate tera;
extern crate glob;
extern crate walkdir;

// graphing
extern crate petgraph;

#[macro_use]
extern crate log;

extern crate regex;

extern crate semver;

extern crate tempfile;
extern crate threadpool;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Float(::std::num::ParseFloatError);
        Int(::std::num::ParseIntError);
        Tmpl(tera::Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        GlobPattern(glob::PatternError);
        GlobIter(glob::GlobError);
        Semver(semver::SemVerError);
    }
    errors {
        MalformedSelector(sel: String) {
            description("selector is not of the form k=v or k!=v")
            display("Malformed label: {}. Expected label in form k=v or k!=v", &sel)
        }
        DuplicateRelease(name: String, namespace: String, context: String) {
            description("two releases share one id")
            display("duplicate release \"{}\" found in namespace \"{}\" in kubecontext \"{}\"", &name, &namespace, &context)
        }
        DuplicateReleaseLegacy(name: String, tiller: String) {
            description("two releases share one id under helm v2")
            display("duplicate release \"{}\" found in tiller namespace \"{}\"", &name, &tiller)
        }
        UnknownEnvironment(env: String) {
            description("environment not declared in any manifest")
            display("environment \"{}\" is not defined in this manifest", &env)
        }
        MissingValuesFile(pattern: String) {
            description("environment values entry matched no files")
            display("no file matching \"{}\" found", &pattern)
        }
        UndefinedNeeds(release: String, needs: String) {
            description("needs entry refers to a release that does not exist")
            display("release \"{}\" depends on nonexistent release \"{}\"", &release, &needs)
        }
        FilteredNeeds(release: String, needs: String) {
            description("needs entry was filtered out by the selector")
            display("release \"{}\" depends on \"{}\" which does not match the selectors. \
                     Please add a selector like \"--selector name={}\", or indicate whether to skip \
                     (--skip-needs) or include (--include-needs) these dependencies", &release, &needs, &needs)
        }
        CyclicDependency(release: String) {
            description("needs graph has a cycle")
            display("circular dependency involving release \"{}\"", &release)
        }
        NoMatchingReleases {
            description("selectors matched no releases in any state")
            display("err: no releases found that matches specified selector")
        }
        EngineFailure(cmd: String, code: i32) {
            description("engine subprocess returned a failure")
            display("command \"{}\" exited with status {}", &cmd, code)
        }
        ReleaseFailed(release: String) {
            description("engine operation failed for a release")
            display("failed processing release {}", &release)
        }
    }
}

/// Pluggable filesystem primitives so the loader can run against memory
pub mod fs;
pub use crate::fs::{Filesystem, RealFs};

/// Deep-merge rules for layered configuration values
pub mod merge;

/// Label selector parsing and release filtering
pub mod selector;
pub use crate::selector::Selector;

/// A renderer of `tera` templates with the manifest function library
pub mod template;

/// Environment value layering
pub mod environment;
pub use crate::environment::Environment;

/// Manifest data model, two-pass loader, composition visitor
pub mod state;
pub use crate::state::{HelmState, ReleaseSpec, ReleaseId};

/// A release dependency planner using `petgraph`
pub mod graph;

/// Bounded-concurrency engine dispatch using `threadpool`
pub mod executor;

/// Affected release accumulation for run summaries
pub mod affected;
pub use crate::affected::Affected;

/// The engine contract and its helm-backed implementation
pub mod engine;
pub use crate::engine::{Engine, EngineRegistry};

/// Remote chart resolution into a per-run scratch directory
pub mod chart;

/// Per-command coordination flows
pub mod run;
pub use crate::run::RunOpts;
