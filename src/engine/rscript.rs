//! Process-backed engine
//!
//! [`RscriptConnector`] drives an `Rscript`-compatible interpreter. Each round
//! trip is one child process; session state survives between round trips in
//! a per-session staging directory:
//!
//! - `session.RData` holds the workspace image, loaded before and saved after
//!   every round trip
//! - `cwd` records the working directory the previous round trip ended in
//! - `value` receives values read back from the session
//!
//! Options are replayed at the start of every round trip. Assignments, file
//! loads and directory changes are buffered and flushed in front of the next
//! round trip that needs an answer.

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

use super::{EngineConnector, EngineError, EngineSession};
use crate::script_runner::{run_tracked, ProcessOutput};
use crate::types::Value;

/// Exit status a round trip uses to report script failure
pub const SCRIPT_FAILURE_STATUS: i32 = 10;

const IMAGE_FILE: &str = "session.RData";
const CWD_FILE: &str = "cwd";
const VALUE_FILE: &str = "value";
const PROGRAM_FILE: &str = "roundtrip.R";

/// Helper defined at the top of every round trip and removed before saving
const EMIT_HELPER: &str = r#".wps_emit <- function(x, file) {
  con <- file(file, "w")
  on.exit(close(con))
  if (identical(x, quote(.wps_missing))) { writeLines("missing", con); return(invisible()) }
  if (is.null(x)) { writeLines("null", con); return(invisible()) }
  if (is.factor(x)) x <- as.character(x)
  kind <- if (is.logical(x)) "logical" else if (is.integer(x)) "integer" else if (is.numeric(x)) "double" else if (is.character(x)) "character" else "unsupported"
  if (kind == "unsupported" || !is.null(dim(x))) { writeLines(c("unsupported", "0"), con); return(invisible()) }
  vals <- if (kind == "character") paste0(":", gsub("\n", "\\n", gsub("\\", "\\\\", x, fixed = TRUE), fixed = TRUE)) else if (kind == "double") sprintf("%.17g", x) else as.character(x)
  vals[is.na(x)] <- "NA"
  writeLines(c(kind, as.character(length(x)), vals), con)
}
"#;

/// Opens sessions backed by an interpreter executable
pub struct RscriptConnector {
    command: String,
    staging_root: Option<PathBuf>,
    timeout: Option<Duration>,
    version: OnceLock<String>,
}

impl RscriptConnector {
    /// `staging_root` is where per-session directories are created; `None`
    /// uses the system temporary directory.
    pub fn new(command: impl Into<String>, staging_root: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            staging_root,
            timeout: None,
            version: OnceLock::new(),
        }
    }

    /// Per-round-trip deadline; `None` or zero waits indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Interpreter version line reported when the first session opened
    pub fn version(&self) -> Option<&str> {
        self.version.get().map(String::as_str)
    }

    fn check_reachable(&self) -> Result<(), EngineError> {
        let out = run_tracked(&self.command, &["--version"], None, self.timeout, "version check")
            .map_err(|e| EngineError::Unreachable(format!("cannot run '{}': {}", self.command, e)))?;
        if !out.success() {
            return Err(EngineError::Unreachable(format!(
                "'{} --version' failed: {}",
                self.command,
                out.stderr_tail()
            )));
        }
        // Rscript prints its version banner on stderr
        let banner = if out.stdout.trim().is_empty() { &out.stderr } else { &out.stdout };
        let line = banner.lines().next().unwrap_or("").trim().to_string();
        if self.version.set(line).is_ok() {
            info!("Engine '{}' reachable: {}", self.command, self.version().unwrap_or(""));
        }
        Ok(())
    }
}

impl EngineConnector for RscriptConnector {
    fn name(&self) -> &str {
        &self.command
    }

    fn open(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        self.check_reachable()?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("wpsr-session-");
        let staging = match &self.staging_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let cwd = staging.path().to_path_buf();
        debug!("Opened engine session in {}", cwd.display());

        Ok(Box::new(RscriptSession {
            command: self.command.clone(),
            timeout: self.timeout,
            staging: Some(staging),
            options: Vec::new(),
            cwd,
            pending: Vec::new(),
        }))
    }
}

struct RscriptSession {
    command: String,
    timeout: Option<Duration>,
    /// `None` once the session is dead or closed
    staging: Option<TempDir>,
    options: Vec<(String, Value)>,
    cwd: PathBuf,
    pending: Vec<String>,
}

/// What a round trip does after the replayed state
enum Body {
    Flush,
    Evaluate(String),
    Read(String),
    Execute(PathBuf),
    SaveImage(PathBuf),
}

impl RscriptSession {
    fn staging_dir(&self) -> Result<&Path, EngineError> {
        self.staging
            .as_ref()
            .map(TempDir::path)
            .ok_or(EngineError::Closed)
    }

    fn build_program(&self, staging: &Path, body: &Body) -> String {
        let image = r_string(&staging.join(IMAGE_FILE).to_string_lossy());
        let mut program = String::new();
        program.push_str(EMIT_HELPER);
        for (name, value) in &self.options {
            let _ = writeln!(program, "options({} = {})", r_string(name), r_literal(value));
        }
        let _ = writeln!(program, "if (file.exists({image})) load({image}, envir = globalenv())");
        let _ = writeln!(program, "setwd({})", r_string(&self.cwd.to_string_lossy()));
        for line in &self.pending {
            program.push_str(line);
            program.push('\n');
        }

        let value_file = r_string(&staging.join(VALUE_FILE).to_string_lossy());
        let mut status = "0".to_string();
        match body {
            Body::Flush => {}
            Body::Evaluate(expr) => {
                let _ = writeln!(
                    program,
                    ".wps_emit(eval(parse(text = {}), envir = globalenv()), {})",
                    r_string(expr),
                    value_file
                );
            }
            Body::Read(name) => {
                let name = r_string(name);
                let _ = writeln!(
                    program,
                    ".wps_emit(if (exists({name}, envir = globalenv(), inherits = FALSE)) get({name}, envir = globalenv()) else quote(.wps_missing), {value_file})"
                );
            }
            Body::Execute(script) => {
                let _ = writeln!(
                    program,
                    ".wps_ok <- tryCatch({{ source({}, local = globalenv()); TRUE }}, error = function(e) {{ message(conditionMessage(e)); FALSE }})",
                    r_string(&script.to_string_lossy())
                );
                status = format!(
                    "if (isTRUE(.wps_ok)) 0 else {}",
                    SCRIPT_FAILURE_STATUS
                );
            }
            Body::SaveImage(path) => {
                let _ = writeln!(
                    program,
                    "save(list = setdiff(ls(envir = globalenv(), all.names = TRUE), \".wps_emit\"), envir = globalenv(), file = {})",
                    r_string(&path.to_string_lossy())
                );
            }
        }

        let _ = writeln!(
            program,
            "writeLines(getwd(), {})",
            r_string(&staging.join(CWD_FILE).to_string_lossy())
        );
        let _ = writeln!(
            program,
            ".wps_status <- {status}\nrm(list = intersect(c(\".wps_emit\", \".wps_ok\"), ls(envir = globalenv(), all.names = TRUE)), envir = globalenv())\nsave(list = setdiff(ls(envir = globalenv(), all.names = TRUE), \".wps_status\"), envir = globalenv(), file = {image})\nquit(save = \"no\", status = .wps_status)"
        );
        program
    }

    /// Run one round trip, flushing pending operations first
    fn round_trip(&mut self, body: Body) -> Result<ProcessOutput, EngineError> {
        let staging = self.staging_dir()?.to_path_buf();
        let program = self.build_program(&staging, &body);
        let program_path = staging.join(PROGRAM_FILE);
        std::fs::write(&program_path, program)?;
        let _ = std::fs::remove_file(staging.join(VALUE_FILE));

        let args = [OsStr::new("--vanilla"), program_path.as_os_str()];
        let out = run_tracked(&self.command, &args, Some(&staging), self.timeout, "round trip")
            .map_err(|e| EngineError::Unreachable(format!("cannot run '{}': {}", self.command, e)))?;

        if out.timed_out {
            self.staging = None;
            return Err(EngineError::Timeout(self.timeout.unwrap_or_default()));
        }
        match out.exit_code {
            Some(0) => {}
            Some(SCRIPT_FAILURE_STATUS) if matches!(body, Body::Execute(_)) => {}
            Some(code) => {
                // State from a failed round trip is not saved; drop the buffer
                self.pending.clear();
                return Err(EngineError::Rejected(format!(
                    "exit status {}: {}",
                    code,
                    out.stderr_tail()
                )));
            }
            None => {
                self.staging = None;
                return Err(EngineError::Closed);
            }
        }

        self.pending.clear();
        if let Ok(cwd) = std::fs::read_to_string(staging.join(CWD_FILE)) {
            let cwd = cwd.trim();
            if !cwd.is_empty() {
                self.cwd = PathBuf::from(cwd);
            }
        }
        Ok(out)
    }

    fn read_emitted(&self) -> Result<Option<Value>, EngineError> {
        let path = self.staging_dir()?.join(VALUE_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Protocol(format!("no value written: {}", e)))?;
        decode_value(&text)
    }
}

impl EngineSession for RscriptSession {
    fn set_option(&mut self, name: &str, value: &Value) -> Result<(), EngineError> {
        self.staging_dir()?;
        self.options.retain(|(existing, _)| existing != name);
        self.options.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<Value, EngineError> {
        self.round_trip(Body::Evaluate(expression.to_string()))?;
        Ok(self.read_emitted()?.unwrap_or(Value::Null))
    }

    fn load_file(&mut self, path: &Path) -> Result<(), EngineError> {
        self.staging_dir()?;
        self.pending.push(format!(
            "source({}, local = globalenv())",
            r_string(&path.to_string_lossy())
        ));
        Ok(())
    }

    fn assign(&mut self, name: &str, value: &Value) -> Result<(), EngineError> {
        self.staging_dir()?;
        self.pending.push(format!(
            "assign({}, {}, envir = globalenv())",
            r_string(name),
            r_literal(value)
        ));
        Ok(())
    }

    fn read_value(&mut self, name: &str) -> Result<Option<Value>, EngineError> {
        self.round_trip(Body::Read(name.to_string()))?;
        self.read_emitted()
    }

    fn execute(&mut self, script: &Path) -> Result<bool, EngineError> {
        let out = self.round_trip(Body::Execute(script.to_path_buf()))?;
        Ok(out.exit_code == Some(0))
    }

    fn working_dir(&mut self) -> Result<PathBuf, EngineError> {
        if !self.pending.is_empty() {
            self.round_trip(Body::Flush)?;
        }
        self.staging_dir()?;
        Ok(self.cwd.clone())
    }

    fn change_dir(&mut self, dir: &Path) -> Result<(), EngineError> {
        self.staging_dir()?;
        // Later round trips start in the new directory
        self.cwd = dir.to_path_buf();
        Ok(())
    }

    fn save_image(&mut self, path: &Path) -> Result<(), EngineError> {
        self.round_trip(Body::SaveImage(path.to_path_buf()))?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        let staging = self.staging_dir()?.to_path_buf();
        match std::fs::remove_file(staging.join(IMAGE_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.options.clear();
        self.pending.clear();
        self.cwd = staging;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.staging.is_some()
    }

    fn close(mut self: Box<Self>) -> Result<(), EngineError> {
        match self.staging.take() {
            Some(dir) => dir.close().map_err(EngineError::from),
            None => Ok(()),
        }
    }
}

/// Quote `s` as an R string literal
pub fn r_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render a value as an R expression
pub fn r_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Integer(i) => format!("{}L", i),
        Value::Number(n) if n.is_nan() => "NaN".to_string(),
        Value::Number(n) if n.is_infinite() => {
            if *n > 0.0 { "Inf".to_string() } else { "-Inf".to_string() }
        }
        Value::Number(n) => format!("{:?}", n),
        Value::Text(s) => r_string(s),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(r_literal).collect();
            let nested = items.iter().any(|v| matches!(v, Value::List(_) | Value::Null));
            if nested {
                format!("list({})", parts.join(", "))
            } else {
                format!("c({})", parts.join(", "))
            }
        }
    }
}

/// Decode the line-oriented value format written by the emit helper.
///
/// `missing` means the binding does not exist; a single-element vector comes
/// back as a scalar, longer vectors as [`Value::List`].
pub fn decode_value(text: &str) -> Result<Option<Value>, EngineError> {
    let mut lines = text.lines();
    let kind = lines
        .next()
        .ok_or_else(|| EngineError::Protocol("empty reply".to_string()))?;
    match kind {
        "missing" => return Ok(None),
        "null" => return Ok(Some(Value::Null)),
        _ => {}
    }
    let count: usize = lines
        .next()
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| EngineError::Protocol(format!("missing length for {}", kind)))?;
    if kind == "unsupported" {
        return Err(EngineError::Protocol(
            "value has no scalar or vector representation".to_string(),
        ));
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = lines
            .next()
            .ok_or_else(|| EngineError::Protocol(format!("expected {} {} values", count, kind)))?;
        items.push(decode_item(kind, raw)?);
    }

    Ok(Some(match items.len() {
        1 => items.remove(0),
        _ => Value::List(items),
    }))
}

fn decode_item(kind: &str, raw: &str) -> Result<Value, EngineError> {
    if raw == "NA" {
        return Ok(Value::Null);
    }
    let bad = || EngineError::Protocol(format!("bad {} value '{}'", kind, raw));
    match kind {
        "logical" => match raw {
            "TRUE" => Ok(Value::Bool(true)),
            "FALSE" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        "integer" => raw.parse().map(Value::Integer).map_err(|_| bad()),
        "double" => match raw {
            "Inf" => Ok(Value::Number(f64::INFINITY)),
            "-Inf" => Ok(Value::Number(f64::NEG_INFINITY)),
            "NaN" => Ok(Value::Number(f64::NAN)),
            _ => raw.parse().map(Value::Number).map_err(|_| bad()),
        },
        "character" => {
            let body = raw.strip_prefix(':').ok_or_else(bad)?;
            Ok(Value::Text(unescape(body)))
        }
        _ => Err(EngineError::Protocol(format!("unknown value kind '{}'", kind))),
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Literal rendering
    // =========================================================================

    #[test]
    fn test_r_string_escapes() {
        assert_eq!(r_string("plain"), "\"plain\"");
        assert_eq!(r_string("a\"b\\c\nd"), "\"a\\\"b\\\\c\\nd\"");
    }

    #[test]
    fn test_r_literal() {
        assert_eq!(r_literal(&Value::Integer(3)), "3L");
        assert_eq!(r_literal(&Value::Number(2.0)), "2.0");
        assert_eq!(r_literal(&Value::Bool(false)), "FALSE");
        assert_eq!(r_literal(&Value::Null), "NULL");
        assert_eq!(
            r_literal(&Value::List(vec![Value::Number(1.5), Value::Number(-2.0)])),
            "c(1.5, -2.0)"
        );
        assert_eq!(
            r_literal(&Value::List(vec![Value::Null, Value::Integer(1)])),
            "list(NULL, 1L)"
        );
        assert_eq!(r_literal(&Value::Number(f64::NEG_INFINITY)), "-Inf");
    }

    // =========================================================================
    // Reply decoding
    // =========================================================================

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_value("missing\n").unwrap(), None);
        assert_eq!(decode_value("null\n").unwrap(), Some(Value::Null));
        assert_eq!(
            decode_value("double\n1\n6\n").unwrap(),
            Some(Value::Number(6.0))
        );
        assert_eq!(
            decode_value("logical\n1\nTRUE\n").unwrap(),
            Some(Value::Bool(true))
        );
        assert_eq!(
            decode_value("character\n1\n:two\\nlines\n").unwrap(),
            Some(Value::Text("two\nlines".to_string()))
        );
    }

    #[test]
    fn test_decode_vectors_and_na() {
        assert_eq!(
            decode_value("integer\n3\n1\nNA\n3\n").unwrap(),
            Some(Value::List(vec![Value::Integer(1), Value::Null, Value::Integer(3)]))
        );
        assert_eq!(
            decode_value("character\n0\n").unwrap(),
            Some(Value::List(vec![]))
        );
        // A string that reads "NA" is distinguishable from a missing value
        assert_eq!(
            decode_value("character\n1\n:NA\n").unwrap(),
            Some(Value::Text("NA".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_value("").is_err());
        assert!(decode_value("double\n").is_err());
        assert!(decode_value("double\n2\n1.0\n").is_err());
        assert!(decode_value("unsupported\n0\n").is_err());
        assert!(decode_value("integer\n1\nabc\n").is_err());
    }

    // =========================================================================
    // Connector
    // =========================================================================

    #[test]
    fn test_missing_interpreter_is_unreachable() {
        let connector = RscriptConnector::new("/nonexistent/Rscript", None);
        let err = connector.open().err().unwrap();
        assert!(matches!(err, EngineError::Unreachable(_)));
        assert!(err.is_connection_loss());
    }

    #[test]
    fn test_program_replays_state() {
        let staging = tempfile::tempdir().unwrap();
        let mut session = RscriptSession {
            command: "Rscript".to_string(),
            timeout: None,
            staging: None,
            options: vec![("wps.algorithm".to_string(), Value::from("demo"))],
            cwd: PathBuf::from("/work/ws"),
            pending: vec!["assign(\"x\", 3L, envir = globalenv())".to_string()],
        };
        let program = session.build_program(staging.path(), &Body::Execute(PathBuf::from("/s/a.R")));
        let options_at = program.find("options(\"wps.algorithm\" = \"demo\")").unwrap();
        let setwd_at = program.find("setwd(\"/work/ws\")").unwrap();
        let assign_at = program.find("assign(\"x\", 3L").unwrap();
        let source_at = program.find("source(\"/s/a.R\"").unwrap();
        assert!(options_at < setwd_at && setwd_at < assign_at && assign_at < source_at);
        assert!(program.contains("else 10"));

        // A dead session refuses further work
        assert!(matches!(session.assign("y", &Value::Null), Err(EngineError::Closed)));
    }
}
