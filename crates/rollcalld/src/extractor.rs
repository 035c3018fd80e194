use rollcall_core::{EmbeddingExtractor, ExtractError};
use serde::Deserialize;
use std::io::Write;
use std::process::{Command, Stdio};

/// What the model command prints on stdout.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelOutput {
    Embedding { embedding: Vec<f32> },
    Error { error: String },
}

/// Runs an external face model once per image.
///
/// The image bytes are piped to the command's stdin. The command answers
/// with `{"embedding":[...]}` or `{"error":"no_face"}` on stdout.
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("ROLLCALL_EXTRACTOR_COMMAND is not set"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn run(&self, image: &[u8]) -> Result<Vec<u8>, ExtractError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractError::Failed(format!("failed to start {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractError::Failed("model stdin unavailable".into()))?;

        // Feed stdin from another thread so a chatty model cannot deadlock us.
        // A model that exits without reading everything breaks the pipe; its
        // exit status below is the error worth reporting.
        let output = std::thread::scope(|scope| {
            scope.spawn(move || {
                let _ = stdin.write_all(image);
            });
            child.wait_with_output()
        })
        .map_err(|e| ExtractError::Failed(format!("model command failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Failed(format!(
                "model exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Check the bytes are an image we can decode before spending model time on them.
fn validate_image(image: &[u8]) -> Result<(), ExtractError> {
    let format = image::guess_format(image)
        .map_err(|e| ExtractError::InvalidImage(format!("unrecognized image format: {e}")))?;
    let decoded = image::load_from_memory_with_format(image, format)
        .map_err(|e| ExtractError::InvalidImage(format!("corrupt {format:?} image: {e}")))?;
    tracing::debug!(
        format = ?format,
        width = decoded.width(),
        height = decoded.height(),
        "image accepted"
    );
    Ok(())
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, ExtractError> {
        validate_image(image)?;
        let stdout = self.run(image)?;

        match serde_json::from_slice::<ModelOutput>(&stdout) {
            Ok(ModelOutput::Embedding { embedding }) => Ok(embedding),
            Ok(ModelOutput::Error { error }) if error == "no_face" => Err(ExtractError::NoFaceDetected),
            Ok(ModelOutput::Error { error }) => Err(ExtractError::Failed(error)),
            Err(e) => Err(ExtractError::Failed(format!("unparseable model output: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::new(4, 4)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn shell(script: &str) -> CommandExtractor {
        let command = ["sh".to_string(), "-c".to_string(), script.to_string()];
        CommandExtractor::new(&command).unwrap()
    }

    #[test]
    fn test_requires_a_command() {
        assert!(CommandExtractor::new(&[]).is_err());
    }

    #[test]
    fn test_rejects_non_image_bytes() {
        let extractor = shell("cat >/dev/null; echo '{\"embedding\":[1.0]}'");
        assert!(matches!(
            extractor.extract(b"definitely not an image"),
            Err(ExtractError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_parses_embedding() {
        let extractor = shell("cat >/dev/null; echo '{\"embedding\":[0.5,-1.0,2.0]}'");
        assert_eq!(extractor.extract(&png()).unwrap(), vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn test_no_face_reported() {
        let extractor = shell("cat >/dev/null; echo '{\"error\":\"no_face\"}'");
        assert_eq!(extractor.extract(&png()), Err(ExtractError::NoFaceDetected));
    }

    #[test]
    fn test_failures_surface() {
        let failing = shell("cat >/dev/null; echo boom >&2; exit 3");
        assert!(matches!(failing.extract(&png()), Err(ExtractError::Failed(_))));

        let garbage = shell("cat >/dev/null; echo nonsense");
        assert!(matches!(garbage.extract(&png()), Err(ExtractError::Failed(_))));
    }
}
