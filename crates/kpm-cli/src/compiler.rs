//! The compiler collaborator backed by the `kcl` binary.

use std::process::Command;

use kpm_core::{CompileError, Compiler, CompilerInput};

/// Compiles by invoking `kcl` on the PATH, handing resolved dependencies
/// over as external package mappings.
pub struct KclCompiler;

impl Compiler for KclCompiler {
    fn compile(&self, input: &CompilerInput) -> Result<String, CompileError> {
        let mut cmd = Command::new("kcl");
        for entry in &input.entries {
            cmd.arg(entry);
        }
        for (name, path) in &input.dep_map {
            cmd.arg("-E").arg(format!("{}={}", name, path.display()));
        }
        cmd.current_dir(&input.work_dir);

        let output = cmd
            .output()
            .map_err(|err| CompileError(format!("failed to invoke the kcl compiler: {err}")))?;
        if !output.status.success() {
            return Err(CompileError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
