use rhai::{Dynamic, EvalAltResult, Map, Position};
use thiserror::Error;

pub const QUOTA_EXCEEDED_MESSAGE: &str = "CPU Quota exceeded.";

const TRACE_HEADER: &str = "stack traceback:";

/// A failure raised by script code or by the CPU sampler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Plain(String),
    #[error("{file}:{line}: {message}")]
    Located { file: String, line: usize, message: String },
    #[error("CPU Quota exceeded.")]
    QuotaExceeded,
}

/// The `(message, trace)` pair handed back to the host when a protected call fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct ScriptFailure {
    pub error: ScriptError,
    pub trace: String,
}

impl ScriptError {
    /// Interprets a value passed to `throw`. Object maps carrying `file`, `line` and `message`
    /// keep their location; anything else is stringified as-is.
    pub fn from_thrown(value: &Dynamic) -> Self {
        if let Some(map) = value.read_lock::<Map>() {
            let file = map.get("file").map(|v| v.to_string());
            let line = map.get("line").and_then(|v| v.as_int().ok()).and_then(|v| usize::try_from(v).ok());
            let message = map.get("message").map(|v| v.to_string());
            if let (Some(file), Some(line), Some(message)) = (file, line, message) {
                return ScriptError::Located { file, line, message };
            }
        }
        ScriptError::Plain(value.to_string())
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, ScriptError::QuotaExceeded)
    }
}

impl ScriptFailure {
    pub fn new(error: ScriptError, trace: impl Into<String>) -> Self {
        Self { error, trace: trace.into() }
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// Converts an evaluation error, unwinding nested call frames into the trace.
    /// `chunk` names the script or hook that was running when no frame carries a source.
    pub fn from_eval(err: EvalAltResult, chunk: &str) -> Self {
        let mut frames = Vec::new();
        let mut source = chunk.to_string();
        let mut current = err;
        let mut leaf = loop {
            match current {
                EvalAltResult::ErrorInFunctionCall(name, fn_source, inner, pos) => {
                    frames.push(format_frame(&source, pos, &format!("in function '{name}'")));
                    if !fn_source.is_empty() {
                        source = fn_source;
                    }
                    current = *inner;
                }
                EvalAltResult::ErrorInModule(path, inner, pos) => {
                    frames.push(format_frame(&source, pos, &format!("in module '{path}'")));
                    source = path;
                    current = *inner;
                }
                other => break other,
            }
        };

        let leaf_pos = leaf.position();
        let thrown = match &leaf {
            EvalAltResult::ErrorRuntime(value, _) => Some(ScriptError::from_thrown(value)),
            _ => None,
        };
        let error = if matches!(leaf, EvalAltResult::ErrorTerminated(..)) {
            ScriptError::QuotaExceeded
        } else if let Some(thrown) = thrown {
            thrown
        } else {
            let _ = leaf.take_position();
            let message = leaf.to_string();
            match leaf_pos.line() {
                Some(line) => ScriptError::Located { file: source.clone(), line, message },
                None => ScriptError::Plain(message),
            }
        };
        frames.push(format_frame(&source, leaf_pos, "in main chunk"));
        frames.reverse();

        let mut trace = String::from(TRACE_HEADER);
        for frame in &frames {
            trace.push_str("\n\t");
            trace.push_str(frame);
        }
        Self { error, trace }
    }
}

fn format_frame(source: &str, pos: Position, label: &str) -> String {
    match pos.line() {
        Some(line) => format!("{source}:{line}: {label}"),
        None => format!("{source}: {label}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thrown_string_stays_plain() {
        let err = EvalAltResult::ErrorRuntime(Dynamic::from("boom".to_string()), Position::new(3, 5));
        let failure = ScriptFailure::from_eval(err, "main");
        assert_eq!(failure.error, ScriptError::Plain("boom".into()));
        assert_eq!(failure.message(), "boom");
        assert!(failure.trace.starts_with("stack traceback:"));
        assert!(failure.trace.contains("main:3"));
    }

    #[test]
    fn thrown_record_keeps_its_location() {
        let mut map = Map::new();
        map.insert("file".into(), Dynamic::from("lib/util".to_string()));
        map.insert("line".into(), Dynamic::from(12 as rhai::INT));
        map.insert("message".into(), Dynamic::from("bad input".to_string()));
        let error = ScriptError::from_thrown(&Dynamic::from_map(map));
        assert_eq!(error.to_string(), "lib/util:12: bad input");
    }

    #[test]
    fn incomplete_record_is_stringified() {
        let mut map = Map::new();
        map.insert("message".into(), Dynamic::from("no location".to_string()));
        let error = ScriptError::from_thrown(&Dynamic::from_map(map));
        assert!(matches!(error, ScriptError::Plain(_)));
    }

    #[test]
    fn termination_maps_to_quota_exceeded_through_frames() {
        let token = Dynamic::from(QUOTA_EXCEEDED_MESSAGE.to_string());
        let inner = EvalAltResult::ErrorTerminated(token, Position::new(2, 1));
        let wrapped = EvalAltResult::ErrorInFunctionCall(
            "spin".into(),
            "main".into(),
            Box::new(inner),
            Position::new(7, 1),
        );
        let failure = ScriptFailure::from_eval(wrapped, "think");
        assert!(failure.error.is_quota_exceeded());
        assert_eq!(failure.message(), "CPU Quota exceeded.");
        assert!(failure.trace.contains("in function 'spin'"));
    }

    #[test]
    fn engine_errors_are_located_in_the_innermost_source() {
        let inner = EvalAltResult::ErrorVariableNotFound("missing".into(), Position::new(4, 9));
        let wrapped = EvalAltResult::ErrorInModule("util".into(), Box::new(inner), Position::new(1, 1));
        let failure = ScriptFailure::from_eval(wrapped, "main");
        match failure.error {
            ScriptError::Located { file, line, message } => {
                assert_eq!(file, "util");
                assert_eq!(line, 4);
                assert!(message.contains("missing"));
                assert!(!message.contains("line 4"));
            }
            other => panic!("expected located error, got {other:?}"),
        }
    }
}
