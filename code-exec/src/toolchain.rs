//! Per-language build and run recipes shared by all execution backends.

use crate::types::Language;

/// One program invocation: binary name plus arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl Step {
    const fn new(program: &'static str, args: &'static [&'static str]) -> Self {
        Self { program, args }
    }

    fn shell_words(&self) -> String {
        std::iter::once(self.program)
            .chain(self.args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How to turn a source file into a running program for one language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toolchain {
    pub language: Language,
    /// File name the decoded source is written to
    pub source_file: &'static str,
    /// Optional compile step run before `run`
    pub compile: Option<Step>,
    pub run: Step,
    /// Default container image for the containerized backend
    pub image: &'static str,
}

static PYTHON: Toolchain = Toolchain {
    language: Language::Python,
    source_file: "main.py",
    compile: None,
    run: Step::new("python3", &["main.py"]),
    image: "python:3.12-alpine",
};

static JAVASCRIPT: Toolchain = Toolchain {
    language: Language::JavaScript,
    source_file: "main.js",
    compile: None,
    run: Step::new("node", &["main.js"]),
    image: "node:20-alpine",
};

static GO: Toolchain = Toolchain {
    language: Language::Go,
    source_file: "main.go",
    compile: None,
    run: Step::new("go", &["run", "main.go"]),
    image: "golang:1.22-alpine",
};

static JAVA: Toolchain = Toolchain {
    language: Language::Java,
    source_file: "Main.java",
    compile: Some(Step::new("javac", &["Main.java"])),
    run: Step::new("java", &["-cp", ".", "Main"]),
    image: "eclipse-temurin:21-jdk-alpine",
};

static BASH: Toolchain = Toolchain {
    language: Language::Bash,
    source_file: "main.sh",
    compile: None,
    run: Step::new("bash", &["main.sh"]),
    image: "bash:5.2",
};

impl Toolchain {
    pub fn for_language(language: Language) -> &'static Toolchain {
        match language {
            Language::Python => &PYTHON,
            Language::JavaScript => &JAVASCRIPT,
            Language::Go => &GO,
            Language::Java => &JAVA,
            Language::Bash => &BASH,
        }
    }

    /// All steps in execution order
    pub fn steps(&self) -> Vec<Step> {
        self.compile.into_iter().chain(Some(self.run)).collect()
    }

    /// Shell script run inside a container.
    ///
    /// Source and stdin arrive as the `SOURCE_CODE` and `STDIN_DATA`
    /// environment variables and are only ever expanded inside double quotes,
    /// so their content is never parsed as shell syntax.
    pub fn container_script(&self) -> String {
        let mut script = format!("printf '%s' \"$SOURCE_CODE\" > {}", self.source_file);
        if let Some(compile) = &self.compile {
            script.push_str(" && ");
            script.push_str(&compile.shell_words());
        }
        script.push_str(" && printf '%s' \"$STDIN_DATA\" | ");
        script.push_str(&self.run.shell_words());
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_language_has_a_toolchain() {
        for language in Language::ALL {
            assert_eq!(Toolchain::for_language(language).language, language);
        }
    }

    #[test]
    fn java_compiles_before_running() {
        let steps = Toolchain::for_language(Language::Java).steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].program, "javac");
        assert_eq!(steps[1].program, "java");
    }

    #[test]
    fn container_script_never_inlines_source() {
        let script = Toolchain::for_language(Language::Python).container_script();
        assert_eq!(
            script,
            "printf '%s' \"$SOURCE_CODE\" > main.py && printf '%s' \"$STDIN_DATA\" | python3 main.py"
        );

        let script = Toolchain::for_language(Language::Java).container_script();
        assert!(script.contains("&& javac Main.java &&"));
    }
}
