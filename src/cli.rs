use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dub a video: transcribe, translate, clone the voice and resync the lips
    Dub {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Target language (code such as "ja" or a name such as "Traditional Chinese")
        #[arg(short, long)]
        target_lang: String,

        /// Output video file (defaults to <input>.<lang>.mp4 next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Remove burned-in subtitles before lip sync
        #[arg(long)]
        remove_subtitles: bool,

        /// Keep the synthesized speech at its natural length
        #[arg(long)]
        no_time_stretch: bool,
    },

    /// Resynthesize lips of a face video or image to match an audio track
    Lipsync {
        /// Video or image containing the face
        #[arg(long)]
        face: PathBuf,

        /// Driving audio (wav, or anything ffmpeg can decode)
        #[arg(short, long)]
        audio: PathBuf,

        /// Output video file
        #[arg(short, long)]
        output: PathBuf,

        /// Use only the first frame of the face video
        #[arg(long = "static")]
        force_static: bool,

        /// Frame rate for still-image input
        #[arg(long)]
        fps: Option<f64>,

        /// Padding (top bottom left right) around detected faces
        #[arg(long, num_args = 4, allow_negative_numbers = true)]
        pads: Option<Vec<i32>>,

        /// Fixed face box (top bottom left right) instead of detection
        #[arg(long = "box", num_args = 4, allow_negative_numbers = true)]
        fixed_box: Option<Vec<i32>>,

        /// Crop (top bottom left right) applied before detection; -1 means the far edge
        #[arg(long, num_args = 4, allow_negative_numbers = true)]
        crop: Option<Vec<i32>>,

        /// Downscale frames by this integer factor
        #[arg(long)]
        resize_factor: Option<u32>,

        /// Rotate frames 90 degrees clockwise
        #[arg(long)]
        rotate: bool,

        /// Disable temporal smoothing of face boxes
        #[arg(long)]
        nosmooth: bool,

        /// Face detection batch size
        #[arg(long)]
        face_det_batch_size: Option<usize>,

        /// Generator batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Transcribe a video or audio file to SRT, optionally translated
    Transcribe {
        /// Input media file
        #[arg(short, long)]
        input: PathBuf,

        /// Output SRT file
        #[arg(short, long)]
        output: PathBuf,

        /// Translate the transcript to this language
        #[arg(short, long)]
        target_lang: Option<String>,
    },

    /// Extract the voice-cloning reference clip from a video
    ExtractReference {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long)]
        output: PathBuf,

        /// Clip length in seconds
        #[arg(short, long)]
        seconds: Option<f64>,
    },

    /// Write the default configuration
    InitConfig {
        /// Output configuration file
        #[arg(short, long, default_value = "redub.toml")]
        output: PathBuf,
    },
}

/// Convert a four-value CLI argument into a `(top, bottom, left, right)` array.
pub fn quad(values: Option<Vec<i32>>) -> Option<[i32; 4]> {
    values.and_then(|v| <[i32; 4]>::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lipsync_quads_accept_negative_values() {
        let args = Args::try_parse_from([
            "redub", "lipsync", "--face", "face.mp4", "--audio", "a.wav", "--output", "out.mp4",
            "--box", "-1", "-1", "-1", "-1", "--crop", "0", "-1", "0", "-1", "--static",
        ])
        .unwrap();

        match args.command {
            Commands::Lipsync {
                fixed_box,
                crop,
                force_static,
                pads,
                ..
            } => {
                assert_eq!(quad(fixed_box), Some([-1, -1, -1, -1]));
                assert_eq!(quad(crop), Some([0, -1, 0, -1]));
                assert_eq!(quad(pads), None);
                assert!(force_static);
            }
            _ => panic!("expected lipsync"),
        }
    }

    #[test]
    fn test_dub_flags() {
        let args = Args::try_parse_from([
            "redub", "-v", "dub", "-i", "talk.mp4", "-t", "ja", "--remove-subtitles",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Commands::Dub {
                target_lang,
                remove_subtitles,
                no_time_stretch,
                output,
                ..
            } => {
                assert_eq!(target_lang, "ja");
                assert!(remove_subtitles);
                assert!(!no_time_stretch);
                assert!(output.is_none());
            }
            _ => panic!("expected dub"),
        }
    }
}
