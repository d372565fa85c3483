// config.rs - Analysis settings

/// Settings that change how functions are rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Remove calls to the ARC runtime (`objc_retain`, `objc_release`, ...)
    /// from rewritten functions.
    pub cleanup_arc_code: bool,
}

impl Settings {
    pub fn with_arc_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_arc_code = enabled;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cleanup_arc_code: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arc_cleanup_on_by_default() {
        assert!(Settings::default().cleanup_arc_code);
        assert!(!Settings::default().with_arc_cleanup(false).cleanup_arc_code);
    }
}
