use std::path::PathBuf;

use crate::vm::bytecode::CodesMarshaller;
use crate::YakErrorExt;

/// A unit of input for the engine: source text or a `.yakc` blob.
#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub path: PathBuf,
    pub content: Vec<u8>,
}

impl Script {
    pub fn new(path: PathBuf) -> Result<Self, Box<dyn YakErrorExt>> {
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let content = std::fs::read(&path).map_err(|e| {
            let err: Box<dyn YakErrorExt> = Box::new(MissingScriptError { path: path.clone(), reason: e.to_string() });
            err
        })?;
        Ok(Script {
            name,
            path,
            content,
        })
    }

    pub fn from_source(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        Script { path: PathBuf::from(&name), name, content: content.into() }
    }

    pub fn is_yakc(&self) -> bool {
        CodesMarshaller::is_yakc(&self.content)
    }

    /// The content as text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_some_and(|t| t.trim().is_empty())
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_yakc() { "yakc" } else { "source" };
        write!(f, "Script: {} ({}) at {:?}", self.name, kind, self.path)
    }
}

#[derive(Debug, Clone)]
pub struct MissingScriptError {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for MissingScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing script at {:?}: {}", self.path, self.reason)
    }
}

impl std::error::Error for MissingScriptError {}

impl YakErrorExt for MissingScriptError {
    fn level(&self) -> crate::Level {
        crate::Level::Error
    }

    fn message(&self) -> String {
        self.to_string()
    }

    fn issuer(&self) -> String {
        "yakvm.script".to_string()
    }

    fn span(&self) -> Option<crate::location::Span> {
        None
    }

    fn location(&self) -> Option<crate::location::Location> {
        Some(crate::location::Location::new(self.path.to_string_lossy().to_string(), 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_structured() {
        let err = Script::new(PathBuf::from("/nonexistent/prog.yakc")).unwrap_err();
        assert_eq!(err.issuer(), "yakvm.script");
        assert!(err.to_string().starts_with("YAKVM | ERROR"));
    }

    #[test]
    fn sniffs_yakc_content() {
        assert!(Script::from_source("a.yakc", vec![0x59, 0x43, 0x00]).is_yakc());
        let src = Script::from_source("a.yak", "println(1)");
        assert!(!src.is_yakc());
        assert_eq!(src.text(), Some("println(1)"));
    }
}
