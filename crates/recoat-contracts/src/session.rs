use anyhow::{bail, Result};

use crate::colors::ColorChoice;

/// An encoded photo plus the media type it was tagged with at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomImage {
    pub data: Vec<u8>,
    pub media_type: String,
}

impl RoomImage {
    pub fn new(data: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            data,
            media_type: media_type.into(),
        }
    }
}

/// One repaint invocation, built at submission time and discarded after the
/// round trip.
#[derive(Debug, Clone)]
pub struct RepaintRequest {
    pub image_data: Vec<u8>,
    pub media_type: String,
    pub color_description: String,
}

/// What the requester hands back: the repainted image, or a display-safe
/// message.
#[derive(Debug, Clone)]
pub enum RepaintOutcome {
    Image(RoomImage),
    Error(String),
}

/// Display state of the workflow. Every reachable value is valid: a
/// generated image exists only in `Succeeded`, an error message only in
/// `Failed`, and a pending request only in `AwaitingResult`.
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle {
        original: Option<RoomImage>,
        color: ColorChoice,
    },
    AwaitingResult {
        original: RoomImage,
        color: ColorChoice,
    },
    Succeeded {
        original: RoomImage,
        generated: RoomImage,
        color: ColorChoice,
    },
    Failed {
        original: RoomImage,
        color: ColorChoice,
        message: String,
    },
}

/// The workflow state machine, remembering the color a reset falls back to.
#[derive(Debug, Clone)]
pub struct Session {
    default_color: ColorChoice,
    state: SessionState,
}

impl Session {
    pub fn new(default_color: ColorChoice) -> Self {
        Self {
            state: SessionState::Idle {
                original: None,
                color: default_color.clone(),
            },
            default_color,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn color(&self) -> &ColorChoice {
        match &self.state {
            SessionState::Idle { color, .. }
            | SessionState::AwaitingResult { color, .. }
            | SessionState::Succeeded { color, .. }
            | SessionState::Failed { color, .. } => color,
        }
    }

    pub fn original(&self) -> Option<&RoomImage> {
        match &self.state {
            SessionState::Idle { original, .. } => original.as_ref(),
            SessionState::AwaitingResult { original, .. }
            | SessionState::Succeeded { original, .. }
            | SessionState::Failed { original, .. } => Some(original),
        }
    }

    pub fn generated(&self) -> Option<&RoomImage> {
        match &self.state {
            SessionState::Succeeded { generated, .. } => Some(generated),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            SessionState::Failed { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn is_requesting(&self) -> bool {
        matches!(self.state, SessionState::AwaitingResult { .. })
    }

    /// Accepts a freshly uploaded photo. A non-image media type is rejected
    /// without touching the held state; a new photo discards any previous
    /// result or error.
    pub fn load_image(&mut self, data: Vec<u8>, media_type: &str) -> Result<()> {
        if !media_type.starts_with("image/") {
            bail!("not an image file ({media_type})");
        }
        if self.is_requesting() {
            bail!("a repaint is already in progress");
        }
        let color = self.color().clone();
        self.state = SessionState::Idle {
            original: Some(RoomImage::new(data, media_type)),
            color,
        };
        Ok(())
    }

    /// Updates the pending color. Never issues a request; the result of a
    /// previous generation stays on screen until the next explicit generate.
    pub fn select_color(&mut self, choice: ColorChoice) -> Result<()> {
        match &mut self.state {
            SessionState::AwaitingResult { .. } => bail!("a repaint is already in progress"),
            SessionState::Idle { color, .. }
            | SessionState::Succeeded { color, .. }
            | SessionState::Failed { color, .. } => {
                *color = choice;
                Ok(())
            }
        }
    }

    /// The explicit generate action. Yields the request to issue and moves
    /// to `AwaitingResult`; a second submission while one is pending is
    /// rejected.
    pub fn begin_repaint(&mut self) -> Result<RepaintRequest> {
        if self.is_requesting() {
            bail!("a repaint is already in progress");
        }
        let Some(original) = self.original().cloned() else {
            bail!("no photo loaded");
        };
        let color = self.color().clone();
        if color.description.trim().is_empty() {
            bail!("the selected color has no description");
        }
        let request = RepaintRequest {
            image_data: original.data.clone(),
            media_type: original.media_type.clone(),
            color_description: color.description.clone(),
        };
        self.state = SessionState::AwaitingResult { original, color };
        Ok(request)
    }

    /// Lands the outcome of the in-flight request.
    pub fn complete(&mut self, outcome: RepaintOutcome) -> Result<()> {
        let SessionState::AwaitingResult { original, color } = &self.state else {
            bail!("no repaint in progress");
        };
        let original = original.clone();
        let color = color.clone();
        self.state = match outcome {
            RepaintOutcome::Image(generated) => SessionState::Succeeded {
                original,
                generated,
                color,
            },
            RepaintOutcome::Error(message) => SessionState::Failed {
                original,
                color,
                message,
            },
        };
        Ok(())
    }

    /// Back to a blank session: no photo, no result, and the color the
    /// session was created with.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle {
            original: None,
            color: self.default_color.clone(),
        };
    }
}
