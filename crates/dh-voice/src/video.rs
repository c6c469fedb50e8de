//! Talking-head video generation.
//!
//! Video synthesis is an external collaborator: the server hands it a
//! reference portrait and a speech track and gets back the path of a
//! rendered `.mp4`.

use crate::error::VoiceError;
use crate::subprocess;
use async_trait::async_trait;
use dh_types::AudioMessage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    /// Number of frames.
    pub length: u32,
    pub steps: u32,
    pub sample_rate: u32,
    pub cfg: f32,
    pub fps: u32,
    pub context_frames: u32,
    pub context_overlap: u32,
    pub quantization: bool,
    /// `-1` lets the model pick.
    pub seed: i64,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            length: 120,
            steps: 25,
            sample_rate: 16000,
            cfg: 3.5,
            fps: 25,
            context_frames: 16,
            context_overlap: 4,
            quantization: true,
            seed: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutcome {
    pub video_path: PathBuf,
    pub took: Duration,
}

#[async_trait]
pub trait VideoGenerator: Send + Sync {
    async fn generate_video(
        &self,
        reference_image: &Path,
        audio_path: &Path,
        params: &VideoParams,
    ) -> Result<VideoOutcome, VoiceError>;

    /// Stages `audio` on disk and renders it against `reference_image`, or
    /// the configured default portrait.
    async fn generate_from_audio(
        &self,
        audio: &AudioMessage,
        reference_image: Option<&Path>,
    ) -> Result<VideoOutcome, VoiceError>;

    /// Pose sequences shipped with the model that a render can follow.
    async fn pose_dirs(&self) -> Result<Vec<PathBuf>, VoiceError> {
        Ok(Vec::new())
    }

    /// Reference portraits shipped with the model.
    async fn reference_images(&self) -> Result<Vec<PathBuf>, VoiceError> {
        Ok(Vec::new())
    }
}

fn default_python() -> PathBuf {
    PathBuf::from("python")
}

fn default_video_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoMimicSettings {
    /// Checkout of the EchoMimic repository containing `infer.py`.
    pub echomimic_path: PathBuf,
    #[serde(default = "default_python")]
    pub python: PathBuf,
    #[serde(default)]
    pub ref_image_path: Option<PathBuf>,
    #[serde(default)]
    pub pose_dir_path: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_video_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub params: VideoParams,
}

/// Runs EchoMimic's inference script as a subprocess.
#[derive(Debug, Clone)]
pub struct EchoMimicGenerator {
    settings: EchoMimicSettings,
    output_dir: PathBuf,
    timeout: Duration,
}

impl EchoMimicGenerator {
    pub async fn new(settings: EchoMimicSettings) -> Result<Self, VoiceError> {
        let output_dir = settings
            .output_dir
            .clone()
            .unwrap_or_else(|| settings.echomimic_path.join("outputs"));
        tokio::fs::create_dir_all(&output_dir).await?;
        Ok(Self {
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            settings,
            output_dir,
        })
    }

    pub fn params(&self) -> &VideoParams {
        &self.settings.params
    }

    fn command(
        &self,
        reference_image: &Path,
        audio_path: &Path,
        params: &VideoParams,
        output_dir: &Path,
    ) -> Command {
        let mut command = Command::new(&self.settings.python);
        command
            .current_dir(&self.settings.echomimic_path)
            .arg(self.settings.echomimic_path.join("infer.py"))
            .arg("--refimg")
            .arg(reference_image)
            .arg("--audio")
            .arg(audio_path);
        if let Some(pose) = &self.settings.pose_dir_path {
            command.arg("--pose").arg(pose);
        }
        command
            .args(["--width", &params.width.to_string()])
            .args(["--height", &params.height.to_string()])
            .args(["--length", &params.length.to_string()])
            .args(["--steps", &params.steps.to_string()])
            .args(["--sample_rate", &params.sample_rate.to_string()])
            .args(["--cfg", &params.cfg.to_string()])
            .args(["--fps", &params.fps.to_string()])
            .args(["--context_frames", &params.context_frames.to_string()])
            .args(["--context_overlap", &params.context_overlap.to_string()])
            .args(["--seed", &params.seed.to_string()])
            .arg("--output_dir")
            .arg(output_dir);
        if params.quantization {
            command.arg("--quantization");
        }
        command
    }
}

#[async_trait]
impl VideoGenerator for EchoMimicGenerator {
    async fn generate_video(
        &self,
        reference_image: &Path,
        audio_path: &Path,
        params: &VideoParams,
    ) -> Result<VideoOutcome, VoiceError> {
        for path in [reference_image, audio_path] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(VoiceError::NotFound(path.to_path_buf()));
            }
        }

        // Each render writes into its own directory so concurrent renders
        // never pick up each other's output.
        let run_dir = self.output_dir.join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&run_dir).await?;

        let started = Instant::now();
        let started_at = SystemTime::now();
        tracing::info!(
            reference = %reference_image.display(),
            audio = %audio_path.display(),
            output = %run_dir.display(),
            "starting video generation"
        );
        let command = self.command(reference_image, audio_path, params, &run_dir);
        subprocess::run_with_stdin(command, Vec::new(), self.timeout).await?;

        let video_path = newest_video(&run_dir, started_at)
            .await?
            .ok_or_else(|| VoiceError::ProcessFailed {
                program: "echomimic".to_string(),
                stderr: "no .mp4 produced".to_string(),
            })?;
        let took = started.elapsed();
        tracing::info!(video = %video_path.display(), took_ms = took.as_millis() as u64, "video generated");
        Ok(VideoOutcome { video_path, took })
    }

    async fn generate_from_audio(
        &self,
        audio: &AudioMessage,
        reference_image: Option<&Path>,
    ) -> Result<VideoOutcome, VoiceError> {
        let reference = reference_image
            .or(self.settings.ref_image_path.as_deref())
            .ok_or_else(|| VoiceError::Config("no reference image configured".to_string()))?
            .to_path_buf();

        let audio_dir = self.output_dir.join("audio");
        tokio::fs::create_dir_all(&audio_dir).await?;
        let audio_path = audio_dir.join(format!("{}.{}", audio.id(), audio.format));
        tokio::fs::write(&audio_path, &audio.data).await?;

        let result = self
            .generate_video(&reference, &audio_path, &self.settings.params)
            .await;
        if let Err(e) = tokio::fs::remove_file(&audio_path).await {
            tracing::warn!(path = %audio_path.display(), "failed to remove staged audio: {}", e);
        }
        result
    }

    async fn pose_dirs(&self) -> Result<Vec<PathBuf>, VoiceError> {
        let assets = self.settings.echomimic_path.join("assets");
        if !tokio::fs::try_exists(&assets).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&assets).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // A pose sequence is a directory of numbered `.npy` frames.
            if entry.file_type().await?.is_dir()
                && tokio::fs::try_exists(path.join("0.npy")).await.unwrap_or(false)
            {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn reference_images(&self) -> Result<Vec<PathBuf>, VoiceError> {
        let assets = self.settings.echomimic_path.join("assets");
        if !tokio::fs::try_exists(&assets).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut images = Vec::new();
        let mut pending = vec![assets];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && is_reference_image(&path) {
                    images.push(path);
                }
            }
        }
        images.sort();
        Ok(images)
    }
}

fn is_reference_image(path: &Path) -> bool {
    let is_image = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("png" | "jpg")
    );
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    is_image && name.contains("reference")
}

/// The most recently modified `.mp4` in `dir` written at or after `since`.
async fn newest_video(dir: &Path, since: SystemTime) -> Result<Option<PathBuf>, VoiceError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if modified < since {
            continue;
        }
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_from_partial_table() {
        let params: VideoParams = from_json(r#"{"width": 768, "fps": 30}"#);
        assert_eq!(params.width, 768);
        assert_eq!(params.fps, 30);
        assert_eq!(params.height, 512);
        assert_eq!(params.steps, 25);
    }

    fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> T {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn newest_video_ignores_stale_and_other_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("old.mp4"), b"x").await.unwrap();
        let since = SystemTime::now() + Duration::from_millis(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::fs::write(dir.path().join("fresh_ws.mp4"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"x").await.unwrap();

        let newest = newest_video(dir.path(), since).await.unwrap().unwrap();
        assert_eq!(newest.file_name().unwrap(), "fresh_ws.mp4");
    }

    async fn generator_in(dir: &Path, python: PathBuf) -> EchoMimicGenerator {
        EchoMimicGenerator::new(EchoMimicSettings {
            echomimic_path: dir.to_path_buf(),
            python,
            ref_image_path: None,
            pose_dir_path: None,
            output_dir: None,
            timeout_secs: 5,
            params: VideoParams::default(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn missing_reference_image_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator_in(dir.path(), default_python()).await;
        let audio = AudioMessage::new(b"ID3\x03".to_vec(), dh_types::AudioFormat::Mp3, 24000, 2);

        let err = generator.generate_from_audio(&audio, None).await.unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));

        let err = generator
            .generate_from_audio(&audio, Some(Path::new("/nonexistent/portrait.png")))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::NotFound(_)));
        assert!(dir.path().join("outputs").is_dir());
    }

    // Stand-in for infer.py: touches `render.mp4` in whatever directory it
    // is handed through `--output_dir`.
    const FAKE_INFER: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "--output_dir" ]; then out="$2"; fi
  shift
done
sleep 0.1
touch "$out/render.mp4"
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_renders_get_their_own_output() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("infer.py"), FAKE_INFER).await.unwrap();
        tokio::fs::write(dir.path().join("portrait.png"), b"png").await.unwrap();
        tokio::fs::write(dir.path().join("speech.wav"), b"wav").await.unwrap();
        let generator = generator_in(dir.path(), PathBuf::from("/bin/sh")).await;
        tokio::fs::write(dir.path().join("outputs/stale.mp4"), b"x").await.unwrap();

        let portrait = dir.path().join("portrait.png");
        let speech = dir.path().join("speech.wav");
        let params = VideoParams::default();
        let (first, second) = tokio::join!(
            generator.generate_video(&portrait, &speech, &params),
            generator.generate_video(&portrait, &speech, &params),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_ne!(first.video_path, second.video_path);
        for outcome in [&first, &second] {
            assert_eq!(outcome.video_path.file_name().unwrap(), "render.mp4");
            assert!(outcome.video_path.starts_with(dir.path().join("outputs")));
            assert!(outcome.video_path.is_file());
        }
    }

    #[tokio::test]
    async fn lists_bundled_poses_and_portraits() {
        let dir = tempfile::tempdir().unwrap();
        let assets = dir.path().join("assets");
        std::fs::create_dir_all(assets.join("pose_01")).unwrap();
        std::fs::write(assets.join("pose_01/0.npy"), b"npy").unwrap();
        std::fs::create_dir_all(assets.join("empty_pose")).unwrap();
        std::fs::create_dir_all(assets.join("halfbody/refimag")).unwrap();
        std::fs::write(assets.join("halfbody/refimag/Reference_01.png"), b"png").unwrap();
        std::fs::write(assets.join("halfbody/refimag/other.png"), b"png").unwrap();
        std::fs::write(assets.join("reference_02.jpg"), b"jpg").unwrap();
        std::fs::write(assets.join("reference_notes.txt"), b"txt").unwrap();
        let generator = generator_in(dir.path(), default_python()).await;

        assert_eq!(generator.pose_dirs().await.unwrap(), vec![assets.join("pose_01")]);
        assert_eq!(
            generator.reference_images().await.unwrap(),
            vec![
                assets.join("halfbody/refimag/Reference_01.png"),
                assets.join("reference_02.jpg"),
            ]
        );
    }

    #[tokio::test]
    async fn listings_are_empty_without_assets() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator_in(dir.path(), default_python()).await;

        assert!(generator.pose_dirs().await.unwrap().is_empty());
        assert!(generator.reference_images().await.unwrap().is_empty());
    }
}
