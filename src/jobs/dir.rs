//! Per-job filesystem contract.
//!
//! Every job owns one directory holding its payload script, a generated
//! wrapper, the start/exit marker files and the captured log. Marker files are
//! the only completion channel between a running job and the scheduler, which
//! lets the scheduler be restarted (or run on a different host) while jobs are
//! in flight.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Prefix of the completion line a wrapper prints when its payload finishes.
pub const COMPLETION_TAG: &str = "#batchq";

/// Contents of the `start` marker: written as soon as execution begins.
#[derive(Debug, Clone, PartialEq)]
pub struct StartMarker {
    pub t_start: f64,
    pub host: String,
}

/// Contents of the `exit` marker: written when the payload finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitMarker {
    pub return_code: i32,
    pub t_exit: f64,
}

#[derive(Debug, Clone)]
pub struct JobDir {
    job_id: i64,
    root: PathBuf,
}

impl JobDir {
    pub fn new(jobs_dir: &Path, job_id: i64) -> Self {
        Self {
            job_id,
            root: jobs_dir.join(job_id.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self) -> PathBuf {
        self.root.join("job.sh")
    }

    pub fn wrapper_path(&self) -> PathBuf {
        self.root.join("wrapper.sh")
    }

    pub fn start_path(&self) -> PathBuf {
        self.root.join("start")
    }

    pub fn exit_path(&self) -> PathBuf {
        self.root.join("exit")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn is_materialized(&self) -> bool {
        self.wrapper_path().is_file()
    }

    /// Write the payload and wrapper for a shell job.
    pub fn materialize_shell(&self, script: &str) -> Result<()> {
        let mut payload = script.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        self.write_scripts(&payload)
    }

    /// Write the payload and wrapper for a bundle. With a single execution
    /// slot the members run sequentially; otherwise they fan out through
    /// `xargs -P`, the OS-level bounded-parallelism executor. Member wrappers
    /// print their completion lines as they finish, so a bundle killed at its
    /// wall-time ceiling still leaves a partial completion record.
    pub fn materialize_bundle(&self, slots: u32, member_wrappers: &[PathBuf]) -> Result<()> {
        let quoted: Vec<String> = member_wrappers
            .iter()
            .map(|p| sh_quote(&p.display().to_string()))
            .collect();
        let mut payload = String::from("#!/bin/sh\n");
        if slots <= 1 {
            for w in &quoted {
                payload.push_str(&format!("/bin/sh {}\n", w));
            }
        } else {
            payload.push_str(&format!(
                "printf '%s\\n' {} | xargs -I{{}} -P {} /bin/sh {{}}\n",
                quoted.join(" "),
                slots
            ));
        }
        self.write_scripts(&payload)
    }

    fn write_scripts(&self, payload: &str) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.payload_path(), payload)?;

        let dir = sh_quote(&self.root.display().to_string());
        let wrapper = format!(
            "#!/bin/sh\n\
             dir={dir}\n\
             t0=$(date +%s)\n\
             echo \"$t0 $(hostname)\" > \"$dir/start\"\n\
             /bin/sh \"$dir/job.sh\" >> \"$dir/log\" 2>&1\n\
             rc=$?\n\
             t1=$(date +%s)\n\
             echo \"$rc $t1\" > \"$dir/exit\"\n\
             echo \"{tag} job {id} ret $rc start $t0 elapsed $(($t1 - $t0))\"\n\
             exit $rc\n",
            dir = dir,
            tag = COMPLETION_TAG,
            id = self.job_id,
        );
        fs::write(self.wrapper_path(), wrapper)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for path in [self.payload_path(), self.wrapper_path()] {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }

    pub fn read_start(&self) -> Result<Option<StartMarker>> {
        let raw = match fs::read_to_string(self.start_path()) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut parts = raw.split_whitespace();
        let t_start = parts.next().and_then(|t| t.parse().ok());
        let host = parts.next().unwrap_or("").to_string();
        Ok(t_start.map(|t_start| StartMarker { t_start, host }))
    }

    pub fn read_exit(&self) -> Result<Option<ExitMarker>> {
        let raw = match fs::read_to_string(self.exit_path()) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut parts = raw.split_whitespace();
        let return_code = parts.next().and_then(|t| t.parse().ok());
        let t_exit = parts.next().and_then(|t| t.parse().ok());
        Ok(match (return_code, t_exit) {
            (Some(return_code), Some(t_exit)) => Some(ExitMarker {
                return_code,
                t_exit,
            }),
            _ => None,
        })
    }

    /// Remove markers left by a previous run, so a resubmission cannot be
    /// mistaken for already complete.
    pub fn clear_markers(&self) -> Result<()> {
        for path in [self.start_path(), self.exit_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Elapsed wall time measured start marker to exit marker, if both exist.
    pub fn measured_walltime(&self) -> Result<Option<f64>> {
        match (self.read_start()?, self.read_exit()?) {
            (Some(start), Some(exit)) => Ok(Some(exit.t_exit - start.t_start)),
            _ => Ok(None),
        }
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Quote a string for POSIX sh.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = JobDir::new(tmp.path(), 7);
        fs::create_dir_all(dir.root()).unwrap();

        assert!(dir.read_start().unwrap().is_none());
        assert!(dir.read_exit().unwrap().is_none());

        fs::write(dir.start_path(), "1700000000 node12\n").unwrap();
        fs::write(dir.exit_path(), "2 1700000090\n").unwrap();

        let start = dir.read_start().unwrap().unwrap();
        assert_eq!(start.t_start, 1_700_000_000.0);
        assert_eq!(start.host, "node12");

        let exit = dir.read_exit().unwrap().unwrap();
        assert_eq!(exit.return_code, 2);
        assert_eq!(dir.measured_walltime().unwrap(), Some(90.0));
    }

    #[test]
    fn shell_materialization_writes_contract_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = JobDir::new(tmp.path(), 3);
        dir.materialize_shell("echo hello").unwrap();

        assert!(dir.is_materialized());
        let payload = fs::read_to_string(dir.payload_path()).unwrap();
        assert_eq!(payload, "echo hello\n");
        let wrapper = fs::read_to_string(dir.wrapper_path()).unwrap();
        assert!(wrapper.contains("job.sh"));
        assert!(wrapper.contains(COMPLETION_TAG));
        assert!(wrapper.contains("job 3"));
    }

    #[test]
    fn bundle_payload_is_sequential_for_one_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = JobDir::new(tmp.path(), 9);
        let members = vec![PathBuf::from("/a/wrapper.sh"), PathBuf::from("/b/wrapper.sh")];
        dir.materialize_bundle(1, &members).unwrap();

        let payload = fs::read_to_string(dir.payload_path()).unwrap();
        assert!(!payload.contains("xargs"));
        assert!(payload.contains("/a/wrapper.sh"));
        assert!(payload.contains("/b/wrapper.sh"));
    }

    #[test]
    fn bundle_payload_fans_out_with_xargs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = JobDir::new(tmp.path(), 9);
        let members = vec![PathBuf::from("/a/wrapper.sh"), PathBuf::from("/b/wrapper.sh")];
        dir.materialize_bundle(4, &members).unwrap();

        let payload = fs::read_to_string(dir.payload_path()).unwrap();
        assert!(payload.contains("xargs"));
        assert!(payload.contains("-P 4"));
    }
}
