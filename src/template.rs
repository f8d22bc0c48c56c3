use std::collections::HashMap;
use std::iter;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use serde_json;
use tera::{Context, Tera, Value};

use super::environment::Environment;
use super::fs::Filesystem;
use super::merge;
use super::{Result, ResultExt};

fn indent(v: Value, m: HashMap<String, Value>) -> tera::Result<Value> {
    let s: String = try_get_value!("indent", "value", String, v);
    // look up indent value or use `2` as default
    let num_spaces: u64 = m.get("spaces").map(Value::as_u64).unwrap_or(None).unwrap_or(2);
    let pad = iter::repeat(' ').take(num_spaces as usize).collect::<String>();
    // prefix all non-empty lines
    let mut xs = vec![];
    for l in s.lines() {
        xs.push(if l == "" { l.to_string() } else { format!("{}{}", pad, l) });
    }
    Ok(serde_json::to_value(&xs.join("\n")).unwrap())
}

fn to_yaml(v: Value, _: HashMap<String, Value>) -> tera::Result<Value> {
    let yaml: serde_yaml::Value =
        serde_yaml::to_value(&v).map_err(|e| format!("toYaml: {}", e))?;
    let s = serde_yaml::to_string(&yaml).map_err(|e| format!("toYaml: {}", e))?;
    // serde_yaml emits a document marker
    Ok(s.trim_start_matches("---").trim_start_matches('\n').trim_end().into())
}

fn from_yaml(v: Value, _: HashMap<String, Value>) -> tera::Result<Value> {
    let s: String = try_get_value!("fromYaml", "value", String, v);
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&s).map_err(|e| format!("fromYaml: {}", e))?;
    let fixed = merge::stringify_keys(yaml);
    serde_json::to_value(&fixed).map_err(|e| format!("fromYaml: {}", e).into())
}

fn to_json(v: Value, _: HashMap<String, Value>) -> tera::Result<Value> {
    let s = serde_json::to_string(&v).map_err(|e| format!("toJson: {}", e))?;
    Ok(s.into())
}

fn from_json(v: Value, _: HashMap<String, Value>) -> tera::Result<Value> {
    let s: String = try_get_value!("fromJson", "value", String, v);
    serde_json::from_str(&s).map_err(|e| format!("fromJson: {}", e).into())
}

fn required(v: Value, m: HashMap<String, Value>) -> tera::Result<Value> {
    let msg = m
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("required value was not set")
        .to_string();
    let empty = match &v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return Err(msg.into());
    }
    Ok(v)
}

fn get(v: Value, m: HashMap<String, Value>) -> tera::Result<Value> {
    let map: serde_json::Map<String, Value> = try_get_value!("get", "value", serde_json::Map<String, Value>, v);
    let key = match m.get("key").and_then(Value::as_str) {
        Some(k) => k.to_string(),
        None => return Err("get: a `key` argument is required".into()),
    };
    match map.get(&key) {
        Some(found) => Ok(found.clone()),
        None => Ok(m.get("default").cloned().unwrap_or(Value::Null)),
    }
}

fn has_key(v: Value, m: HashMap<String, Value>) -> tera::Result<Value> {
    let map: serde_json::Map<String, Value> = try_get_value!("hasKey", "value", serde_json::Map<String, Value>, v);
    let key = match m.get("key").and_then(Value::as_str) {
        Some(k) => k.to_string(),
        None => return Err("hasKey: a `key` argument is required".into()),
    };
    Ok(Value::Bool(map.contains_key(&key)))
}

fn keys(v: Value, _: HashMap<String, Value>) -> tera::Result<Value> {
    let map: serde_json::Map<String, Value> = try_get_value!("keys", "value", serde_json::Map<String, Value>, v);
    let ks: Vec<String> = map.keys().cloned().collect();
    Ok(serde_json::to_value(&ks).unwrap())
}

fn merge_filter(v: Value, m: HashMap<String, Value>) -> tera::Result<Value> {
    let base: serde_yaml::Value = serde_yaml::to_value(&v).map_err(|e| format!("merge: {}", e))?;
    let with = match m.get("with") {
        Some(w) => w.clone(),
        None => return Err("merge: a `with` argument is required".into()),
    };
    let overrides: serde_yaml::Value =
        serde_yaml::to_value(&with).map_err(|e| format!("merge: {}", e))?;
    let mut out = base;
    merge::merge_value(&mut out, &overrides);
    serde_json::to_value(&merge::stringify_keys(out)).map_err(|e| format!("merge: {}", e).into())
}

/// A document renderer bound to one manifest directory
///
/// Relative paths in `readFile`/`readDir` resolve against the directory of
/// the manifest being rendered, and all file access goes through the
/// injected `Filesystem`.
pub struct Renderer {
    fs: Arc<dyn Filesystem>,
    dir: PathBuf,
}

impl Renderer {
    pub fn new(fs: Arc<dyn Filesystem>, dir: PathBuf) -> Self {
        Renderer { fs, dir }
    }

    fn instance(&self) -> Tera {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.register_filter("indent", indent);
        tera.register_filter("toYaml", to_yaml);
        tera.register_filter("fromYaml", from_yaml);
        tera.register_filter("toJson", to_json);
        tera.register_filter("fromJson", from_json);
        tera.register_filter("required", required);
        tera.register_filter("get", get);
        tera.register_filter("hasKey", has_key);
        tera.register_filter("keys", keys);
        tera.register_filter("merge", merge_filter);

        let fs = self.fs.clone();
        let dir = self.dir.clone();
        tera.register_global_function(
            "readFile",
            Box::new(move |m: HashMap<String, Value>| {
                let path = match m.get("path").and_then(Value::as_str) {
                    Some(p) => p.to_string(),
                    None => return Err("readFile: a `path` argument is required".into()),
                };
                let data = fs
                    .read_to_string(&dir.join(&path))
                    .map_err(|e| format!("readFile: {}", e))?;
                Ok(data.into())
            }),
        );

        let fs = self.fs.clone();
        let dir = self.dir.clone();
        tera.register_global_function(
            "readDir",
            Box::new(move |m: HashMap<String, Value>| {
                let path = match m.get("path").and_then(Value::as_str) {
                    Some(p) => p.to_string(),
                    None => return Err("readDir: a `path` argument is required".into()),
                };
                let pattern = dir.join(&path).join("*");
                let entries = fs
                    .glob(&pattern.to_string_lossy())
                    .map_err(|e| format!("readDir: {}", e))?;
                let names: Vec<String> = entries.iter().map(|p| p.to_string_lossy().into()).collect();
                Ok(serde_json::to_value(&names).unwrap())
            }),
        );

        tera.register_global_function(
            "env",
            Box::new(|m: HashMap<String, Value>| {
                let name = match m.get("name").and_then(Value::as_str) {
                    Some(n) => n.to_string(),
                    None => return Err("env: a `name` argument is required".into()),
                };
                Ok(std::env::var(&name).unwrap_or_default().into())
            }),
        );

        tera.register_global_function(
            "requiredEnv",
            Box::new(|m: HashMap<String, Value>| {
                let name = match m.get("name").and_then(Value::as_str) {
                    Some(n) => n.to_string(),
                    None => return Err("requiredEnv: a `name` argument is required".into()),
                };
                match std::env::var(&name) {
                    Ok(v) if !v.is_empty() => Ok(v.into()),
                    _ => Err(format!("requiredEnv: {} is not set", name).into()),
                }
            }),
        );

        tera.register_global_function(
            "exec",
            Box::new(|m: HashMap<String, Value>| {
                let command = match m.get("command").and_then(Value::as_str) {
                    Some(c) => c.to_string(),
                    None => return Err("exec: a `command` argument is required".into()),
                };
                let args: Vec<String> = match m.get("args") {
                    Some(Value::Array(xs)) => xs
                        .iter()
                        .map(|x| x.as_str().map(String::from).ok_or("exec: args must be strings"))
                        .collect::<std::result::Result<_, _>>()?,
                    None => vec![],
                    _ => return Err("exec: `args` must be an array".into()),
                };
                let out = Command::new(&command)
                    .args(&args)
                    .output()
                    .map_err(|e| format!("exec: failed to spawn {}: {}", command, e))?;
                if !out.status.success() {
                    return Err(format!(
                        "exec: {} exited with status {}",
                        command,
                        out.status.code().unwrap_or(1001)
                    )
                    .into());
                }
                let stdout = String::from_utf8_lossy(&out.stdout).trim_end().to_string();
                Ok(stdout.into())
            }),
        );

        tera
    }

    /// Render one manifest document against an environment
    ///
    /// The environment map is exposed as `Environment.Values` with `Values`
    /// and `StateValues` as aliases.
    pub fn render(&self, name: &str, content: &str, env: &Environment) -> Result<String> {
        let mut tera = self.instance();
        tera.add_raw_template(name, content)
            .chain_err(|| format!("invalid template in {}", name))?;
        let ctx = context_for(env)?;
        Ok(tera.render(name, &ctx)?)
    }

    /// Render a small inline template (output paths, value file names)
    pub fn one_off(&self, tpl: &str, ctx: &Context) -> Result<String> {
        let mut tera = self.instance();
        tera.add_raw_template("one_off", tpl)?;
        Ok(tera.render("one_off", ctx)?)
    }
}

fn context_for(env: &Environment) -> Result<Context> {
    let values = merge::stringify_keys(serde_yaml::Value::Mapping(env.values.clone()));
    let jvalues: serde_json::Value = serde_json::to_value(&values)?;
    let mut ctx = Context::new();
    ctx.insert(
        "Environment",
        &serde_json::json!({ "Name": env.name, "Values": jvalues }),
    );
    ctx.insert("Values", &jvalues);
    ctx.insert("StateValues", &jvalues);
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::Renderer;
    use crate::environment::Environment;
    use crate::fs::MemFs;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn renderer(fs: MemFs) -> Renderer {
        Renderer::new(Arc::new(fs), PathBuf::from("/deploy"))
    }

    fn env(yaml: &str) -> Environment {
        Environment {
            name: "default".into(),
            values: serde_yaml::from_str(yaml).unwrap(),
            defaults: Default::default(),
        }
    }

    #[test]
    fn environment_values_aliases() {
        let r = renderer(MemFs::new());
        let e = env("foo: FOO");
        let out = r
            .render("t", "{{ Environment.Values.foo }}/{{ Values.foo }}/{{ Environment.Name }}", &e)
            .unwrap();
        assert_eq!(out, "FOO/FOO/default");
    }

    #[test]
    fn read_file_resolves_against_manifest_dir() {
        let fs = MemFs::new().add("/deploy/snippets/extra.yaml", "injected: true");
        let r = renderer(fs);
        let out = r.render("t", "{{ readFile(path=\"snippets/extra.yaml\") }}", &env("{}")).unwrap();
        assert_eq!(out, "injected: true");
    }

    #[test]
    fn yaml_roundtrip_filters() {
        let r = renderer(MemFs::new());
        let e = env("svc:\n  replicas: 3");
        let out = r.render("t", "{{ Values.svc | toYaml }}", &e).unwrap();
        assert_eq!(out.trim(), "replicas: 3");
        let out = r
            .render("t", "{{ \"a: 1\" | fromYaml | toJson }}", &e)
            .unwrap();
        assert_eq!(out, "{\"a\":1}");
    }

    #[test]
    fn required_errors_on_empty() {
        let r = renderer(MemFs::new());
        let e = env("present: yes-it-is\nempty: \"\"");
        assert!(r.render("t", "{{ Values.present | required(msg=\"need it\") }}", &e).is_ok());
        let err = r
            .render("t", "{{ Values.empty | required(msg=\"need it\") }}", &e)
            .unwrap_err();
        assert!(format!("{:?}", err).contains("need it"));
    }

    #[test]
    fn dict_helpers() {
        let r = renderer(MemFs::new());
        let e = env("m:\n  a: 1\n  b: 2");
        assert_eq!(r.render("t", "{{ Values.m | hasKey(key=\"a\") }}", &e).unwrap(), "true");
        assert_eq!(r.render("t", "{{ Values.m | keys | join(sep=\",\") }}", &e).unwrap(), "a,b");
        assert_eq!(r.render("t", "{{ Values.m | get(key=\"b\") }}", &e).unwrap(), "2");
        assert_eq!(
            r.render("t", "{{ Values.m | get(key=\"zz\", default=9) }}", &e).unwrap(),
            "9"
        );
    }

    #[test]
    fn merge_filter_respects_array_replace() {
        let r = renderer(MemFs::new());
        let e = env("a:\n  xs: [1]\nb:\n  xs: [2]");
        let out = r
            .render("t", "{{ Values.a | merge(with=Values.b) | toJson }}", &e)
            .unwrap();
        assert_eq!(out, "{\"xs\":[2]}");
    }

    #[test]
    fn exec_captures_stdout() {
        let r = renderer(MemFs::new());
        let e = env("cmdargs: [deployed]");
        let out = r
            .render("t", "{{ exec(command=\"echo\", args=Values.cmdargs) }}", &e)
            .unwrap();
        assert_eq!(out, "deployed");
    }

    #[test]
    fn env_functions() {
        std::env::set_var("FLOTILLA_TEST_ENV", "from-env");
        let r = renderer(MemFs::new());
        let out = r.render("t", "{{ env(name=\"FLOTILLA_TEST_ENV\") }}", &env("{}")).unwrap();
        assert_eq!(out, "from-env");
        let out = r.render("t", "{{ requiredEnv(name=\"FLOTILLA_TEST_ENV\") }}", &env("{}")).unwrap();
        assert_eq!(out, "from-env");
        assert!(r
            .render("t", "{{ requiredEnv(name=\"FLOTILLA_DEFINITELY_UNSET\") }}", &env("{}"))
            .is_err());
    }

    #[test]
    fn control_flow_renders() {
        let r = renderer(MemFs::new());
        let e = env("releases: [a, b]");
        let out = r
            .render("t", "{% for x in Values.releases %}{{ x }};{% endfor %}", &e)
            .unwrap();
        assert_eq!(out, "a;b;");
    }
}
