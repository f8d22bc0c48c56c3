#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate libc;
extern crate loggerv;

extern crate flotilla;

use flotilla::{Error, Result, RunOpts};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::env;
use std::process;

fn print_error_debug(e: &Error) {
    // normal case - unwind the error chain
    for e in e.iter().skip(1) {
        warn!("caused by: {}", e);
    }
}

fn main() {
    let app = App::new("flotilla")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .global_settings(&[AppSettings::ColoredHelp])
        .about("Declarative helm release orchestration")
        .arg(Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .global(true)
            .help("Increase verbosity"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .global(true)
            .help("Adds line numbers to log statements"))
        .arg(Arg::with_name("log-level")
            .long("log-level")
            .takes_value(true)
            .possible_values(&["error", "warn", "info", "debug", "trace"])
            .global(true)
            .help("Log level (alternative to -v occurrences)"))
        .arg(Arg::with_name("file")
            .short("f")
            .long("file")
            .takes_value(true)
            .global(true)
            .help("Manifest to load (defaults to helmfile.yaml)"))
        .arg(Arg::with_name("environment")
            .short("e")
            .long("environment")
            .takes_value(true)
            .global(true)
            .help("Environment name to load values for"))
        .arg(Arg::with_name("namespace")
            .short("n")
            .long("namespace")
            .takes_value(true)
            .global(true)
            .help("Namespace overriding every release"))
        .arg(Arg::with_name("selector")
            .short("l")
            .long("selector")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .global(true)
            .help("Release filter of the form k=v or k!=v (repeatable)"))
        .arg(Arg::with_name("kube-context")
            .long("kube-context")
            .takes_value(true)
            .global(true)
            .help("Kube context overriding every release"))
        .arg(Arg::with_name("state-values-set")
            .long("state-values-set")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .global(true)
            .help("Additional state value of the form path=value (repeatable)"))
        .arg(Arg::with_name("state-values-file")
            .long("state-values-file")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .global(true)
            .help("Additional state values file (repeatable)"))
        .arg(Arg::with_name("helm-binary")
            .short("b")
            .long("helm-binary")
            .takes_value(true)
            .global(true)
            .help("Path to the helm binary"))
        .arg(Arg::with_name("args")
            .long("args")
            .takes_value(true)
            .global(true)
            .help("Extra arguments appended to every engine call"))

        .subcommand(SubCommand::with_name("repos")
            .about("Add and update chart repositories for every state"))
        .subcommand(SubCommand::with_name("deps")
            .about("Update chart dependencies for every state")
            .arg(Arg::with_name("skip-repos")
                .long("skip-repos")
                .help("Skip repository setup before building dependencies")))
        .subcommand(SubCommand::with_name("diff")
            .about("Diff releases against the live cluster")
            .arg(Arg::with_name("concurrency")
                .long("concurrency")
                .takes_value(true)
                .help("Maximum parallel engine calls within a group"))
            .arg(Arg::with_name("context")
                .long("context")
                .takes_value(true)
                .help("Diff context lines"))
            .arg(Arg::with_name("color")
                .long("color")
                .conflicts_with("no-color")
                .help("Force colored diff output"))
            .arg(Arg::with_name("no-color")
                .long("no-color")
                .help("Force uncolored diff output"))
            .arg(Arg::with_name("detailed-exitcode")
                .long("detailed-exitcode")
                .help("Exit 2 when changes are present"))
            .arg(Arg::with_name("suppress-secrets")
                .long("suppress-secrets")
                .help("Hide secret contents from the diff"))
            .arg(Arg::with_name("show-secrets")
                .long("show-secrets")
                .conflicts_with("suppress-secrets")
                .help("Show secret contents in the diff"))
            .arg(Arg::with_name("skip-deps")
                .long("skip-deps")
                .help("Skip chart dependency building"))
            .arg(Arg::with_name("skip-needs")
                .long("skip-needs")
                .help("Ignore needs pointing outside the selection"))
            .arg(Arg::with_name("include-needs")
                .long("include-needs")
                .help("Pull needed releases back into the selection"))
            .arg(Arg::with_name("include-transitive-needs")
                .long("include-transitive-needs")
                .help("Pull the whole needs closure back into the selection")))
        .subcommand(SubCommand::with_name("apply")
            .about("Diff, then converge changed releases group by group")
            .arg(Arg::with_name("concurrency")
                .long("concurrency")
                .takes_value(true)
                .help("Maximum parallel engine calls within a group"))
            .arg(Arg::with_name("context")
                .long("context")
                .takes_value(true)
                .help("Diff context lines"))
            .arg(Arg::with_name("color")
                .long("color")
                .conflicts_with("no-color")
                .help("Force colored diff output"))
            .arg(Arg::with_name("no-color")
                .long("no-color")
                .help("Force uncolored diff output"))
            .arg(Arg::with_name("detailed-exitcode")
                .long("detailed-exitcode")
                .help("Exit 2 when changes were applied"))
            .arg(Arg::with_name("suppress-secrets")
                .long("suppress-secrets")
                .help("Hide secret contents from the diff"))
            .arg(Arg::with_name("skip-deps")
                .long("skip-deps")
                .help("Skip chart dependency building"))
            .arg(Arg::with_name("skip-crds")
                .long("skip-crds")
                .help("Skip CRD installation on sync"))
            .arg(Arg::with_name("skip-needs")
                .long("skip-needs")
                .help("Ignore needs pointing outside the selection"))
            .arg(Arg::with_name("include-needs")
                .long("include-needs")
                .help("Pull needed releases back into the selection"))
            .arg(Arg::with_name("include-transitive-needs")
                .long("include-transitive-needs")
                .help("Pull the whole needs closure back into the selection"))
            .arg(Arg::with_name("interactive")
                .short("i")
                .long("interactive")
                .help("Confirm affected releases before converging")))
        .subcommand(SubCommand::with_name("sync")
            .about("Converge every release without a diff gate")
            .arg(Arg::with_name("concurrency")
                .long("concurrency")
                .takes_value(true)
                .help("Maximum parallel engine calls within a group"))
            .arg(Arg::with_name("skip-deps")
                .long("skip-deps")
                .help("Skip chart dependency building"))
            .arg(Arg::with_name("skip-crds")
                .long("skip-crds")
                .help("Skip CRD installation on sync"))
            .arg(Arg::with_name("skip-needs")
                .long("skip-needs")
                .help("Ignore needs pointing outside the selection"))
            .arg(Arg::with_name("include-needs")
                .long("include-needs")
                .help("Pull needed releases back into the selection"))
            .arg(Arg::with_name("include-transitive-needs")
                .long("include-transitive-needs")
                .help("Pull the whole needs closure back into the selection")))
        .subcommand(SubCommand::with_name("template")
            .about("Render releases through the engine")
            .arg(Arg::with_name("skip-deps")
                .long("skip-deps")
                .help("Skip chart dependency building"))
            .arg(Arg::with_name("output-dir")
                .long("output-dir")
                .takes_value(true)
                .help("Write rendered manifests below this directory"))
            .arg(Arg::with_name("output-dir-template")
                .long("output-dir-template")
                .takes_value(true)
                .help("Per-release output directory template")))
        .subcommand(SubCommand::with_name("test")
            .about("Run chart tests for every release"))
        .subcommand(SubCommand::with_name("lint")
            .about("Lint charts for every release")
            .arg(Arg::with_name("skip-deps")
                .long("skip-deps")
                .help("Skip chart dependency building")))
        .subcommand(SubCommand::with_name("delete")
            .about("Delete releases, dependents before dependencies")
            .arg(Arg::with_name("concurrency")
                .long("concurrency")
                .takes_value(true)
                .help("Maximum parallel engine calls within a group"))
            .arg(Arg::with_name("purge")
                .long("purge")
                .help("Purge release history as well (engine v2)")))
        .subcommand(SubCommand::with_name("destroy")
            .about("Delete releases and purge their history")
            .arg(Arg::with_name("concurrency")
                .long("concurrency")
                .takes_value(true)
                .help("Maximum parallel engine calls within a group")))
        .subcommand(SubCommand::with_name("list")
            .about("List releases across all states")
            .arg(Arg::with_name("output")
                .long("output")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .help("Output format")))
        .subcommand(SubCommand::with_name("write-values")
            .about("Write each release's merged values map to disk")
            .arg(Arg::with_name("output-file-template")
                .long("output-file-template")
                .takes_value(true)
                .help("Per-release output file template")))
        .subcommand(SubCommand::with_name("status")
            .about("Show engine status for every release"));

    // arg parse
    let args = app.get_matches();
    let name = args.subcommand_name().unwrap();
    match run(&args) {
        Err(e) => {
            error!("{} error: {}", name, e);
            print_error_debug(&e);
            process::exit(1);
        }
        Ok(code) => {
            process::exit(code);
        }
    }
}

fn run(args: &ArgMatches) -> Result<i32> {
    // initialise deps and set log default - always show INFO messages (+1)
    let verbosity = match args.value_of("log-level") {
        Some("error") => 0,
        Some("warn") => 0,
        Some("info") => 1,
        Some("debug") => 2,
        Some("trace") => 3,
        _ => args.occurrences_of("verbose") + 1,
    };
    loggerv::Logger::new()
        .verbosity(verbosity)
        .module_path(true)
        .line_numbers(args.is_present("debug"))
        .init()
        .unwrap();

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    // See https://github.com/rust-lang/rust/issues/46016
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    dispatch_commands(args)
}

/// Selector inheritance mode, read once at program start
fn experimental_explicit_selectors() -> bool {
    match env::var("EXPERIMENTAL") {
        Ok(v) => v == "true" || v == "explicit-selector-inheritance",
        Err(_) => false,
    }
}

/// Collect the resolved options for a subcommand invocation
fn run_opts(sub: &ArgMatches) -> Result<RunOpts> {
    let mut opts = RunOpts::default();
    opts.file = sub.value_of("file").map(String::from);
    if let Some(e) = sub.value_of("environment") {
        opts.environment = e.into();
    }
    opts.namespace = sub.value_of("namespace").map(String::from);
    if let Some(sels) = sub.values_of("selector") {
        opts.selectors = sels.map(String::from).collect();
    }
    opts.kube_context = sub.value_of("kube-context").map(String::from);
    if let Some(files) = sub.values_of("state-values-file") {
        opts.state_values_files = files.map(String::from).collect();
    }
    if let Some(sets) = sub.values_of("state-values-set") {
        opts.state_values_sets = sets.map(String::from).collect();
    }
    if let Some(b) = sub.value_of("helm-binary") {
        opts.helm_binary = b.into();
    }
    if sub.is_present("concurrency") {
        opts.concurrency = value_t!(sub.value_of("concurrency"), usize)
            .map_err(|e| Error::from(format!("invalid --concurrency: {}", e)))?;
    }
    if sub.is_present("context") {
        let n = value_t!(sub.value_of("context"), u32)
            .map_err(|e| Error::from(format!("invalid --context: {}", e)))?;
        opts.context_lines = Some(n);
    }
    if sub.is_present("color") {
        opts.color = Some(true);
    } else if sub.is_present("no-color") {
        opts.color = Some(false);
    }
    opts.detailed_exitcode = sub.is_present("detailed-exitcode");
    opts.suppress_secrets = sub.is_present("suppress-secrets") && !sub.is_present("show-secrets");
    opts.skip_deps = sub.is_present("skip-deps");
    opts.skip_repos = sub.is_present("skip-repos");
    opts.skip_crds = sub.is_present("skip-crds");
    opts.skip_needs = sub.is_present("skip-needs");
    opts.include_needs = sub.is_present("include-needs") || sub.is_present("include-transitive-needs");
    opts.include_transitive_needs = sub.is_present("include-transitive-needs");
    opts.interactive = sub.is_present("interactive");
    if let Some(raw) = sub.value_of("args") {
        opts.engine_args = raw.split_whitespace().map(String::from).collect();
    }
    opts.explicit_selector_inheritance = experimental_explicit_selectors();

    if opts.skip_needs && opts.include_needs {
        return Err("--skip-needs and --include-needs are mutually exclusive".into());
    }
    Ok(opts)
}

/// Dispatch clap arguments to flotilla handlers
fn dispatch_commands(args: &ArgMatches) -> Result<i32> {
    if let Some(a) = args.subcommand_matches("repos") {
        flotilla::run::Runner::new(run_opts(a)?)?.repos()?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("deps") {
        flotilla::run::Runner::new(run_opts(a)?)?.deps()?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("diff") {
        let opts = run_opts(a)?;
        let detailed = opts.detailed_exitcode;
        let changed = flotilla::run::Runner::new(opts)?.diff()?;
        return Ok(if detailed && changed { 2 } else { 0 });
    }
    if let Some(a) = args.subcommand_matches("apply") {
        let opts = run_opts(a)?;
        let detailed = opts.detailed_exitcode;
        let changed = flotilla::run::Runner::new(opts)?.apply()?;
        return Ok(if detailed && changed { 2 } else { 0 });
    }
    if let Some(a) = args.subcommand_matches("sync") {
        flotilla::run::Runner::new(run_opts(a)?)?.sync()?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("template") {
        let output_dir = a.value_of("output-dir").map(String::from);
        let tpl = a
            .value_of("output-dir-template")
            .unwrap_or("{{ OutputDir }}/{{ State.BaseName }}-{{ Release.Name }}")
            .to_string();
        flotilla::run::Runner::new(run_opts(a)?)?.template(output_dir.as_deref(), &tpl)?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("test") {
        flotilla::run::Runner::new(run_opts(a)?)?.test()?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("lint") {
        flotilla::run::Runner::new(run_opts(a)?)?.lint()?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("delete") {
        flotilla::run::Runner::new(run_opts(a)?)?.delete(a.is_present("purge"))?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("destroy") {
        flotilla::run::Runner::new(run_opts(a)?)?.delete(true)?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("list") {
        let json = a.value_of("output") == Some("json");
        flotilla::run::Runner::new(run_opts(a)?)?.list(json)?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("write-values") {
        let tpl = a
            .value_of("output-file-template")
            .unwrap_or("{{ Release.Name }}.values.yaml")
            .to_string();
        flotilla::run::Runner::new(run_opts(a)?)?.write_values(&tpl)?;
        return Ok(0);
    }
    if let Some(a) = args.subcommand_matches("status") {
        flotilla::run::Runner::new(run_opts(a)?)?.status()?;
        return Ok(0);
    }

    unreachable!("Subcommand valid, but not implemented");
}
