//! Chaos tests for xfer
//!
//! Interrupts sessions at arbitrary points, damages logs and destination
//! trees, and checks that every run either converges or stops with a
//! resumable log and a precise error.

use ::xfer::*;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// A populated source tree and the paths a session needs
pub struct ChaosFixture {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub log: PathBuf,
    pub file_count: u64,
}

impl ChaosFixture {
    pub fn new(file_count: u64) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("dest");
        let log = temp_dir.path().join("chaos.log");

        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..file_count {
            let path = source.join(format!("group_{}/item_{:03}.dat", i % 4, i));
            fs::create_dir_all(path.parent().unwrap())?;
            let size = rng.random_range(1..4_096);
            let mut content = vec![0u8; size];
            rng.fill(&mut content[..]);
            fs::write(path, content)?;
        }

        Ok(Self {
            temp_dir,
            source,
            dest,
            log,
            file_count,
        })
    }

    pub fn builder(&self) -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn run(&self, builder: SessionBuilder) -> Result<SessionResult> {
        let mut session = builder.build(self.source.clone(), self.dest.clone(), self.log.clone())?;
        Ok(session.run()?)
    }

    /// Run a session that cancels itself after `limit` completed items
    pub fn run_until(&self, limit: u64) -> Result<SessionResult> {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let completed = Arc::new(AtomicU64::new(0));
        let counter = completed.clone();

        let builder = self
            .builder()
            .cancel_flag(cancel)
            .progress_callback(Arc::new(move |_info: ProgressInfo| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= limit {
                    trigger.cancel();
                }
            }));
        let result = self.run(builder)?;
        info!(
            "Interrupted run finished {} items",
            completed.load(Ordering::SeqCst)
        );
        Ok(result)
    }
}

fn completed_names(log: &Path) -> Result<Vec<PathBuf>> {
    Ok(replay(log)?.completed.into_iter().map(|c| c.name).collect())
}

/// Rewrite the first `TRANSFER_COMPLETE` line of a log with a bogus digest
fn tamper_first_completion(log: &Path) -> Result<PathBuf> {
    let text = fs::read_to_string(log)?;
    let mut tampered = None;
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        match Entry::decode(line) {
            Ok(Entry::TransferComplete(mut complete)) if tampered.is_none() => {
                complete.digest = "0".repeat(complete.digest.len());
                tampered = Some(complete.name.clone());
                out.push_str(&Entry::from(complete).encode()?);
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }

    fs::write(log, out)?;
    tampered.ok_or_else(|| anyhow::anyhow!("log has no completion to tamper with"))
}

/// Rewrite a log, keeping comments and the entries `keep` accepts
fn rewrite_log(log: &Path, mut keep: impl FnMut(&Entry) -> bool) -> Result<()> {
    let text = fs::read_to_string(log)?;
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let kept = match Entry::decode(line) {
            Ok(entry) => keep(&entry),
            Err(_) => true,
        };
        if kept {
            out.push_str(line);
            out.push('\n');
        }
    }

    fs::write(log, out)?;
    Ok(())
}

/// Keep the header and only the first announced METADATA/request pair
fn first_announced_pair() -> impl FnMut(&Entry) -> bool {
    let mut metadata = 0;
    let mut requests = 0;
    move |entry| match entry {
        Entry::Metadata(_) => {
            metadata += 1;
            metadata == 1
        }
        Entry::TransferRequest(_) | Entry::VerifyRequest(_) => {
            requests += 1;
            requests == 1
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_interrupt_and_resume() -> Result<()> {
        let fixture = ChaosFixture::new(20)?;

        let first = fixture.run_until(7)?;
        assert_eq!(first.state, SessionState::Interrupted);
        assert!(matches!(first.failure, Some(XferError::Cancelled)));
        assert_eq!(first.progress.files_transferred, 7);
        assert_eq!(completed_names(&fixture.log)?.len(), 7);
        assert!(!replay(&fixture.log)?.is_sealed());

        let second = fixture.run(fixture.builder())?;
        assert!(second.is_complete());
        assert!(second.resumed);
        assert_eq!(second.skipped, 7);
        assert_eq!(second.totals.files_to_transfer, fixture.file_count);
        assert_eq!(second.progress.files_transferred, fixture.file_count);

        // Resumption never repeats a completion
        let names = completed_names(&fixture.log)?;
        let unique: HashSet<&PathBuf> = names.iter().collect();
        assert_eq!(names.len() as u64, fixture.file_count);
        assert_eq!(unique.len(), names.len());
        assert!(replay(&fixture.log)?.is_sealed());
        Ok(())
    }

    #[test]
    fn test_repeated_interruptions_converge() -> Result<()> {
        let fixture = ChaosFixture::new(24)?;
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..4 {
            let result = fixture.run_until(rng.random_range(1..5))?;
            if result.is_complete() {
                break;
            }
        }
        let last = fixture.run(fixture.builder())?;
        assert!(last.is_complete());

        let names = completed_names(&fixture.log)?;
        let unique: HashSet<&PathBuf> = names.iter().collect();
        assert_eq!(unique.len() as u64, fixture.file_count);
        assert_eq!(names.len(), unique.len());

        let source = build_manifest(&fixture.source)?;
        let dest = build_manifest(&fixture.dest)?;
        assert!(diff(&source, &dest)?.is_empty());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_torn_log_tail_is_discarded() -> Result<()> {
        let fixture = ChaosFixture::new(10)?;
        let first = fixture.run_until(3)?;
        assert_eq!(first.state, SessionState::Interrupted);

        // A crash in the middle of appending a record
        let clean_len = fs::metadata(&fixture.log)?.len();
        let mut file = fs::OpenOptions::new().append(true).open(&fixture.log)?;
        file.write_all(b"TRANSFER_COMPLETE {\"name\":\"group_0/ite")?;
        drop(file);

        let replayed = replay(&fixture.log)?;
        assert_eq!(replayed.completed.len(), 3);
        assert_eq!(replayed.valid_len, clean_len);

        let second = fixture.run(fixture.builder())?;
        assert!(second.is_complete());
        assert_eq!(second.skipped, 3);

        // The torn bytes are gone and the log decodes end to end
        let log = replay(&fixture.log)?;
        assert!(log.is_sealed());
        assert_eq!(log.completed.len(), 10);
        Ok(())
    }

    #[test]
    fn test_malformed_line_stops_resume() -> Result<()> {
        let fixture = ChaosFixture::new(5)?;
        fixture.run_until(2)?;

        let mut file = fs::OpenOptions::new().append(true).open(&fixture.log)?;
        file.write_all(b"NOT_A_TAG {}\n")?;
        drop(file);

        let err = fixture.run(fixture.builder()).unwrap_err();
        let err = err.downcast::<XferError>()?;
        assert!(matches!(err, XferError::MalformedEntry { .. }));
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_tampered_completion_is_rejected() -> Result<()> {
        let fixture = ChaosFixture::new(8)?;
        fixture.run_until(4)?;

        let tampered = tamper_first_completion(&fixture.log)?;
        let before = fs::read(&fixture.log)?;

        let result = fixture.run(fixture.builder())?;
        assert_eq!(result.state, SessionState::Interrupted);
        match &result.failure {
            Some(XferError::IntegrityViolation { path, .. }) => assert_eq!(path, &tampered),
            other => panic!("expected integrity violation, got {:?}", other),
        }

        // Nothing was appended to a log that cannot be trusted
        assert_eq!(fs::read(&fixture.log)?, before);
        Ok(())
    }

    #[test]
    fn test_source_changed_after_announce() -> Result<()> {
        let fixture = ChaosFixture::new(6)?;
        fixture.run_until(1)?;

        // The last planned file changes between the two runs
        let log = replay(&fixture.log)?;
        let victim = log.planned.last().map(|i| i.source.name.clone()).unwrap();
        fs::write(fixture.source.join(&victim), b"rewritten after planning")?;

        let result = fixture.run(fixture.builder())?;
        assert_eq!(result.state, SessionState::Interrupted);
        assert!(result.failure.as_ref().is_some_and(|e| e.is_integrity_violation()));
        // The unexpected content never reached the destination
        assert!(!fixture.dest.join(&victim).exists());
        Ok(())
    }

    #[test]
    fn test_corrupted_destination_is_repaired() -> Result<()> {
        let fixture = ChaosFixture::new(12)?;
        assert!(fixture.run(fixture.builder())?.is_complete());

        // Same size, different bytes
        let victim = fixture.dest.join("group_1/item_005.dat");
        let mut content = fs::read(&victim)?;
        content[0] = content[0].wrapping_add(1);
        fs::write(&victim, &content)?;

        let log = fixture.temp_dir.path().join("repair.log");
        let mut session = fixture
            .builder()
            .build(fixture.source.clone(), fixture.dest.clone(), log.clone())?;
        let result = session.run()?;

        assert!(result.is_complete());
        assert_eq!(result.totals.files_to_verify, 1);
        assert_eq!(result.progress.files_retransferred, 1);
        assert_eq!(
            fs::read(&victim)?,
            fs::read(fixture.source.join("group_1/item_005.dat"))?
        );
        Ok(())
    }

    #[test]
    fn test_stray_temp_files_do_not_leak_into_sync() -> Result<()> {
        let fixture = ChaosFixture::new(4)?;
        fixture.run_until(2)?;

        let leftovers: Vec<_> = walkdir::WalkDir::new(&fixture.dest)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(copier::TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());

        assert!(fixture.run(fixture.builder())?.is_complete());
        Ok(())
    }
    #[test]
    #[traced_test]
    fn test_partial_announce_without_completions_is_planned_again() -> Result<()> {
        let fixture = ChaosFixture::new(3)?;
        let flag = CancelFlag::new();
        flag.cancel();
        let stopped = fixture.run(fixture.builder().cancel_flag(flag))?;
        assert_eq!(stopped.state, SessionState::Interrupted);

        // A crash after the first announced item
        rewrite_log(&fixture.log, first_announced_pair())?;
        let partial = replay(&fixture.log)?;
        assert_eq!(partial.planned.len(), 1);
        assert!(partial.completed.is_empty());

        let result = fixture.run(fixture.builder())?;
        assert!(result.is_complete());
        assert!(!result.resumed);
        assert_eq!(result.skipped, 0);
        assert_eq!(result.progress.files_transferred, fixture.file_count);

        let log = replay(&fixture.log)?;
        assert_eq!(log.planned.len() as u64, fixture.file_count);
        assert_eq!(log.completed.len() as u64, fixture.file_count);
        assert!(log.is_sealed());
        Ok(())
    }

    #[test]
    fn test_partial_announce_with_completion_is_invalid() -> Result<()> {
        let fixture = ChaosFixture::new(3)?;
        fixture.run_until(1)?;

        rewrite_log(&fixture.log, first_announced_pair())?;
        let partial = replay(&fixture.log)?;
        assert_eq!(partial.planned.len(), 1);
        assert_eq!(partial.completed.len(), 1);
        let before = fs::read(&fixture.log)?;

        let err = fixture.run(fixture.builder()).unwrap_err();
        let err = err.downcast::<XferError>()?;
        assert!(matches!(err, XferError::InvalidLog(_)), "unexpected error: {:?}", err);
        assert_eq!(fs::read(&fixture.log)?, before);
        Ok(())
    }

    #[test]
    fn test_completion_without_request_is_invalid() -> Result<()> {
        let fixture = ChaosFixture::new(5)?;
        fixture.run_until(2)?;

        let orphan: Entry =
            TransferComplete::now("group_9/never_planned.dat", 17, "ab".repeat(64)).into();
        let mut file = fs::OpenOptions::new().append(true).open(&fixture.log)?;
        writeln!(file, "{}", orphan.encode()?)?;
        drop(file);
        let before = fs::read(&fixture.log)?;

        let err = fixture.run(fixture.builder()).unwrap_err();
        let err = err.downcast::<XferError>()?;
        match err {
            XferError::InvalidLog(message) => assert!(message.contains("never_planned.dat")),
            other => panic!("expected invalid log, got {:?}", other),
        }
        assert!(!fixture.dest.join("group_9/never_planned.dat").exists());
        assert_eq!(fs::read(&fixture.log)?, before);
        Ok(())
    }
}
