//! Text-to-speech. Discovers an external synthesizer once per process and
//! caches it; when none is available (or the engine fails) it synthesizes a
//! sine tone whose frequency derives from a hash of the input text, so the
//! tool always produces a playable WAV file.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use twox_hash::XxHash3_64;

use crate::config::AudioConfig;
use crate::task::{ExecutionInput, ExecutionResult};
use crate::tool::Tool;

/// Probed in order; the first one that spawns wins.
const ENGINES: &[&str] = &["espeak-ng", "espeak", "festival", "say"];

const SAMPLE_RATE: u32 = 22_050;
const MIN_TONE_SECS: u64 = 1;
const MAX_TONE_SECS: u64 = 10;
/// Characters of input per second of fallback tone.
const CHARS_PER_SECOND: u64 = 12;

pub struct TtsTool {
    output_dir: PathBuf,
    /// `None` = not probed yet; `Some(None)` = probed, nothing available.
    engine: Mutex<Option<Option<String>>>,
    counter: AtomicU64,
}

impl TtsTool {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            engine: Mutex::new(None),
            counter: AtomicU64::new(0),
        }
    }

    /// One-time discovery under the mutex; the result (including "nothing
    /// found") is cached for the process lifetime.
    async fn discover_engine(&self) -> Option<String> {
        let mut cached = self.engine.lock().await;
        if let Some(engine) = cached.as_ref() {
            return engine.clone();
        }

        let mut found = None;
        for candidate in ENGINES {
            let probe = Command::new(candidate)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if probe.is_ok() {
                tracing::info!(engine = %candidate, "speech engine discovered");
                found = Some((*candidate).to_owned());
                break;
            }
        }
        if found.is_none() {
            tracing::info!("no speech engine available, using tone synthesis");
        }

        *cached = Some(found.clone());
        found
    }

    fn next_output_path(&self) -> PathBuf {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        self.output_dir
            .join(format!("speech_{sequence:06}_{millis}.wav"))
    }

    async fn synthesize_with_engine(
        &self,
        engine: &str,
        text: &str,
        path: &Path,
    ) -> Result<(), String> {
        let status = match engine {
            "espeak-ng" | "espeak" => Command::new(engine)
                .arg("-w")
                .arg(path)
                .arg(text)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| format!("Failed to run {engine}: {e}"))?,
            "festival" => {
                // Festival itself only plays audio; its text2wave companion
                // writes files.
                let mut child = Command::new("text2wave")
                    .arg("-o")
                    .arg(path)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| format!("Failed to run text2wave: {e}"))?;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin
                        .write_all(text.as_bytes())
                        .await
                        .map_err(|e| format!("Failed to pipe text: {e}"))?;
                }
                child
                    .wait()
                    .await
                    .map_err(|e| format!("Failed to wait for text2wave: {e}"))?
            },
            "say" => Command::new("say")
                .arg("-o")
                .arg(path)
                .arg("--data-format=LEI16@22050")
                .arg(text)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| format!("Failed to run say: {e}"))?,
            other => return Err(format!("Unknown speech engine '{other}'")),
        };

        if status.success() {
            Ok(())
        } else {
            Err(format!("Speech engine {engine} exited with {status}"))
        }
    }

    async fn synthesize_tone(&self, text: &str, path: &Path) -> Result<(), String> {
        let samples = sine_wave(text);
        let wav = wav_bytes(&samples);
        tokio::fs::write(path, wav)
            .await
            .map_err(|e| format!("Failed to write WAV file: {e}"))
    }
}

fn tone_frequency(text: &str) -> f64 {
    let mut hasher = XxHash3_64::default();
    text.hash(&mut hasher);
    220.0 + (hasher.finish() % 660) as f64
}

fn tone_duration_secs(text: &str) -> u64 {
    (text.chars().count() as u64 / CHARS_PER_SECOND).clamp(MIN_TONE_SECS, MAX_TONE_SECS)
}

fn sine_wave(text: &str) -> Vec<i16> {
    let frequency = tone_frequency(text);
    let total = u64::from(SAMPLE_RATE) * tone_duration_secs(text);
    (0..total)
        .map(|i| {
            let t = i as f64 / f64::from(SAMPLE_RATE);
            let amplitude = 0.3 * f64::from(i16::MAX);
            (amplitude * (std::f64::consts::TAU * frequency * t).sin()) as i16
        })
        .collect()
}

/// PCM16 mono WAV: the classic 44-byte little-endian header followed by the
/// samples.
fn wav_bytes(samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let byte_rate = SAMPLE_RATE * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

impl Tool for TtsTool {
    fn name(&self) -> &str {
        "text_to_speech"
    }

    fn description(&self) -> &str {
        "Synthesizes speech audio from text and writes a WAV file into the \
         configured output directory; returns the file path."
    }

    fn run(&self, input: ExecutionInput) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(async move {
            let text = input.content.trim().to_owned();
            if text.is_empty() {
                return ExecutionResult::failure("Text must not be blank");
            }
            if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
                return ExecutionResult::failure(format!(
                    "Cannot create output directory: {e}"
                ));
            }

            let path = self.next_output_path();
            let mut used_engine = "tone".to_owned();

            if let Some(engine) = self.discover_engine().await {
                match self.synthesize_with_engine(&engine, &text, &path).await {
                    Ok(()) => used_engine = engine,
                    Err(e) => {
                        tracing::warn!(engine = %engine, error = %e, "speech engine failed, using tone");
                        if let Err(e) = self.synthesize_tone(&text, &path).await {
                            return ExecutionResult::failure(e);
                        }
                    },
                }
            } else if let Err(e) = self.synthesize_tone(&text, &path).await {
                return ExecutionResult::failure(e);
            }

            ExecutionResult::ok(format!("Audio written to {}", path.display())).with_metadata(
                serde_json::json!({
                    "path": path.display().to_string(),
                    "engine": used_engine,
                }),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_layout() {
        let samples = vec![0i16; 100];
        let wav = wav_bytes(&samples);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(u32::from_le_bytes(wav[16..20].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(wav[20..22].try_into().unwrap()), 1); // PCM
        assert_eq!(u16::from_le_bytes(wav[22..24].try_into().unwrap()), 1); // mono
        assert_eq!(
            u32::from_le_bytes(wav[24..28].try_into().unwrap()),
            SAMPLE_RATE
        );
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 200);
        assert_eq!(wav.len(), 44 + 200);
    }

    #[test]
    fn test_tone_frequency_is_stable_per_text() {
        assert_eq!(tone_frequency("hello"), tone_frequency("hello"));
        let f = tone_frequency("hello");
        assert!((220.0..880.0).contains(&f));
    }

    #[test]
    fn test_tone_duration_scales_and_clamps() {
        assert_eq!(tone_duration_secs("hi"), 1);
        assert_eq!(tone_duration_secs(&"x".repeat(60)), 5);
        assert_eq!(tone_duration_secs(&"x".repeat(100_000)), 10);
    }

    #[tokio::test]
    async fn test_blank_text_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TtsTool::new(&AudioConfig {
            output_dir: dir.path().to_path_buf(),
        });
        let result = tool.run(ExecutionInput::new("  ")).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_produces_parsable_wav() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TtsTool::new(&AudioConfig {
            output_dir: dir.path().to_path_buf(),
        });

        let result = tool.run(ExecutionInput::new("hello world")).await;
        assert!(result.success, "{}", result.output);

        let path = PathBuf::from(result.metadata["path"].as_str().unwrap());
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 44);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
    }

    #[tokio::test]
    async fn test_output_files_are_uniquely_named() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TtsTool::new(&AudioConfig {
            output_dir: dir.path().to_path_buf(),
        });

        let first = tool.run(ExecutionInput::new("one")).await;
        let second = tool.run(ExecutionInput::new("two")).await;
        assert!(first.success && second.success);
        assert_ne!(first.metadata["path"], second.metadata["path"]);
    }
}
