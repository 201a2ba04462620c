use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{Result, DubError};

/// Rounds odd frame sizes up to the next even size.
pub const EVEN_PAD_FILTER: &str = "pad=ceil(iw/2)*2:ceil(ih/2)*2";

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    pub fn copy_video(self) -> Self {
        self.video_codec("copy")
    }

    pub fn copy_audio(self) -> Self {
        self.audio_codec("copy")
    }

    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    pub fn no_audio(self) -> Self {
        self.arg("-an")
    }

    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    pub fn audio_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-af").arg(filter)
    }

    /// Select an input stream for the output
    pub fn map<S: Into<String>>(self, spec: S) -> Self {
        self.arg("-map").arg(spec)
    }

    /// Limit output duration in seconds
    pub fn duration(self, seconds: f64) -> Self {
        self.arg("-t").arg(format!("{:.3}", seconds))
    }

    /// Execute the command
    pub async fn execute(&self) -> Result<()> {
        self.output_bytes().await.map(|_| ())
    }

    /// Execute the command and return its captured stdout
    pub async fn output_bytes(&self) -> Result<Vec<u8>> {
        debug!("Executing media processing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DubError::Media(format!("Failed to execute media processor: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DubError::Media(format!(
                "{} failed: {}",
                self.description,
                stderr
            )));
        }

        Ok(output.stdout)
    }
}

/// Rectangle blanked out by the subtitle removal filter, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtitleBand {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SubtitleBand {
    /// Band covering the lower part of the frame: `top` and `margin` are
    /// fractions of the frame height and width. The band stops 10 px above
    /// the bottom edge since `delogo` rejects rectangles touching the border.
    pub fn for_frame(frame_width: u32, frame_height: u32, top: f64, margin: f64) -> Option<Self> {
        let x = (frame_width as f64 * margin).round() as u32;
        let y = (frame_height as f64 * top).round() as u32;
        let right = frame_width.saturating_sub(x);
        let bottom = frame_height.saturating_sub(10);

        if x == 0 || y == 0 || right <= x + 1 || bottom <= y + 1 {
            return None;
        }

        Some(Self {
            x,
            y,
            width: right - x,
            height: bottom - y,
        })
    }
}

/// Builder for common media processing operations
pub struct MediaCommandBuilder {
    binary_path: String,
    probe_path: String,
}

impl MediaCommandBuilder {
    /// Create a new command builder
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, probe_path: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            probe_path: probe_path.into(),
        }
    }

    /// Build audio extraction command (16 kHz mono PCM)
    pub fn extract_audio<P: AsRef<Path>>(
        &self,
        video_path: P,
        audio_path: P,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio extraction")
            .overwrite()
            .input(video_path)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(16000)
            .audio_channels(1)
            .output(audio_path)
    }

    /// Build reference clip extraction: the first `seconds` of audio as 16 kHz mono PCM
    pub fn extract_reference_audio<P: AsRef<Path>>(
        &self,
        video_path: P,
        audio_path: P,
        seconds: f64,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Reference audio extraction")
            .overwrite()
            .input(video_path)
            .duration(seconds)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(16000)
            .audio_channels(1)
            .output(audio_path)
    }

    /// Build stream probe returning JSON on stdout
    pub fn probe_video<P: AsRef<Path>>(&self, video_path: P) -> MediaCommand {
        MediaCommand::new(&self.probe_path, "Video probe")
            .args(["-v", "error", "-select_streams", "v:0"])
            .arg("-show_entries")
            .arg("stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration")
            .args(["-of", "json"])
            .output(video_path)
    }

    /// Build raw frame decode: packed rgb24 frames on stdout
    pub fn decode_frames<P: AsRef<Path>>(&self, video_path: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Frame decoding")
            .args(["-v", "error"])
            .input(video_path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-")
    }

    /// Build raw frame encode reading packed rgb24 frames from stdin
    pub fn encode_frames<P: AsRef<Path>>(
        &self,
        output_path: P,
        width: u32,
        height: u32,
        fps: f64,
        additional_options: &[String],
    ) -> MediaCommand {
        let mut cmd = MediaCommand::new(&self.binary_path, "Frame encoding")
            .overwrite()
            .args(["-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s").arg(format!("{}x{}", width, height))
            .arg("-r").arg(format!("{}", fps))
            .arg("-i").arg("-")
            .no_audio();

        // yuv420p needs even dimensions; pad the odd edge by one pixel.
        if width % 2 == 1 || height % 2 == 1 {
            cmd = cmd.video_filter(EVEN_PAD_FILTER);
        }

        cmd = cmd.video_codec("libx264").arg("-pix_fmt").arg("yuv420p");

        for option in additional_options {
            cmd = cmd.arg(option);
        }

        cmd.output(output_path)
    }

    /// Build mux of a rendered video stream with the driving audio track
    pub fn mux_audio<P: AsRef<Path>>(
        &self,
        video_path: P,
        audio_path: P,
        output_path: P,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio/video mux")
            .overwrite()
            .input(audio_path)
            .input(video_path)
            .map("1:v:0")
            .map("0:a:0")
            .copy_video()
            .audio_codec("aac")
            .output(output_path)
    }

    /// Build tempo change keeping pitch, using a chain of atempo filters
    pub fn stretch_audio<P: AsRef<Path>>(
        &self,
        input_path: P,
        output_path: P,
        tempo: f64,
    ) -> MediaCommand {
        let filter = atempo_chain(tempo)
            .iter()
            .map(|step| format!("atempo={:.6}", step))
            .collect::<Vec<_>>()
            .join(",");

        MediaCommand::new(&self.binary_path, format!("Time stretch (x{:.3})", tempo))
            .overwrite()
            .input(input_path)
            .audio_filter(filter)
            .output(output_path)
    }

    /// Build subtitle band removal with the delogo filter
    pub fn remove_subtitle_band<P: AsRef<Path>>(
        &self,
        input_path: P,
        output_path: P,
        band: SubtitleBand,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Subtitle removal")
            .overwrite()
            .input(input_path)
            .video_filter(format!(
                "delogo=x={}:y={}:w={}:h={}",
                band.x, band.y, band.width, band.height
            ))
            .video_codec("libx264")
            .copy_audio()
            .output(output_path)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check")
            .arg("-version")
    }
}

/// Split a tempo factor into atempo steps, each within the filter's [0.5, 2.0] range.
pub fn atempo_chain(tempo: f64) -> Vec<f64> {
    let mut remaining = tempo;
    let mut steps = Vec::new();

    if !remaining.is_finite() || remaining <= 0.0 {
        return vec![1.0];
    }

    while remaining > 2.0 {
        steps.push(2.0);
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        steps.push(0.5);
        remaining /= 0.5;
    }
    steps.push(remaining);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> MediaCommandBuilder {
        MediaCommandBuilder::new("ffmpeg", "ffprobe")
    }

    #[test]
    fn test_atempo_chain_stays_in_range() {
        let steps = atempo_chain(5.0);
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| (0.5..=2.0).contains(s)));
        let product: f64 = steps.iter().product();
        assert!((product - 5.0).abs() < 1e-9);

        let slow = atempo_chain(0.2);
        assert!(slow.iter().all(|s| (0.5..=2.0).contains(s)));
        assert!((slow.iter().product::<f64>() - 0.2).abs() < 1e-9);

        assert_eq!(atempo_chain(1.25), vec![1.25]);
    }

    #[test]
    fn test_mux_maps_video_from_render_and_audio_from_driver() {
        let cmd = builder().mux_audio(
            Path::new("render.mp4"),
            Path::new("speech.wav"),
            Path::new("out.mp4"),
        );
        let joined = cmd.args.join(" ");
        assert!(joined.starts_with("-y -i speech.wav -i render.mp4"));
        assert!(joined.contains("-map 1:v:0 -map 0:a:0"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_encode_frames_declares_geometry() {
        let cmd = builder().encode_frames(Path::new("out.mp4"), 640, 360, 25.0, &["-crf".into(), "20".into()]);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-s 640x360"));
        assert!(joined.contains("-r 25"));
        assert!(joined.contains("-i -"));
        assert!(joined.contains("-crf 20"));
        assert!(!joined.contains("-vf"));
    }

    #[test]
    fn test_encode_frames_pads_odd_geometry() {
        let cmd = builder().encode_frames(Path::new("out.mp4"), 301, 1080, 25.0, &[]);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-s 301x1080"));
        assert!(joined.contains(&format!("-vf {} -c:v libx264 -pix_fmt yuv420p", EVEN_PAD_FILTER)));

        let cmd = builder().encode_frames(Path::new("out.mp4"), 274, 153, 25.0, &[]);
        assert!(cmd.args.join(" ").contains(EVEN_PAD_FILTER));
    }

    #[test]
    fn test_subtitle_band_geometry() {
        let band = SubtitleBand::for_frame(1920, 1080, 0.85, 0.1).unwrap();
        assert_eq!(band.x, 192);
        assert_eq!(band.y, 918);
        assert_eq!(band.width, 1920 - 2 * 192);
        assert_eq!(band.height, 1070 - 918);

        assert!(SubtitleBand::for_frame(16, 12, 0.95, 0.1).is_none());
    }

    #[test]
    fn test_reference_extraction_limits_duration() {
        let cmd = builder().extract_reference_audio(Path::new("in.mp4"), Path::new("ref.wav"), 10.0);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-t 10.000"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-ac 1"));
    }
}
