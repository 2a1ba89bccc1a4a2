//! Local display of the annotated feed for `aerial-watch run`.
//!
//! Needs the `opencv` feature for a window; other builds always run headless.

#[cfg(feature = "opencv")]
mod window {
    use opencv::{core::Vector, highgui, imgcodecs, prelude::*};
    use tracing::{debug, info, warn};

    const WINDOW_NAME: &str = "Aerial Watch";
    const KEY_ESC: i32 = 27;

    /// A highgui window, or nothing when running headless.
    pub(crate) struct Preview {
        open: bool,
    }

    impl Preview {
        pub(crate) fn open(enabled: bool) -> Self {
            if !enabled {
                return Self { open: false };
            }
            match highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE) {
                Ok(()) => {
                    info!("preview window open; press 'q' or Esc to quit");
                    Self { open: true }
                }
                Err(err) => {
                    warn!("failed to open preview window ({err}); running headless");
                    Self { open: false }
                }
            }
        }

        /// Show one encoded frame and poll the keyboard.
        ///
        /// Returns `false` once the viewer asked to quit. Display errors close
        /// the window and leave the monitor running headless.
        pub(crate) fn show(&mut self, jpeg: &[u8]) -> bool {
            if !self.open {
                return true;
            }
            match self.render(jpeg) {
                Ok(key) => !(key == KEY_ESC || key == i32::from(b'q') || key == i32::from(b'Q')),
                Err(err) => {
                    warn!("preview failed ({err}); continuing headless");
                    self.close();
                    true
                }
            }
        }

        fn render(&self, jpeg: &[u8]) -> opencv::Result<i32> {
            let buffer = Vector::<u8>::from_slice(jpeg);
            let frame = imgcodecs::imdecode(&buffer, imgcodecs::IMREAD_COLOR)?;
            if frame.empty() {
                debug!("preview skipped an undecodable frame");
            } else {
                highgui::imshow(WINDOW_NAME, &frame)?;
            }
            highgui::wait_key(1)
        }

        fn close(&mut self) {
            if std::mem::take(&mut self.open) {
                let _ = highgui::destroy_window(WINDOW_NAME);
            }
        }
    }

    impl Drop for Preview {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(not(feature = "opencv"))]
mod window {
    use tracing::info;

    pub(crate) struct Preview;

    impl Preview {
        pub(crate) fn open(enabled: bool) -> Self {
            if enabled {
                info!("built without the `opencv` feature; running headless");
            }
            Self
        }

        pub(crate) fn show(&mut self, _jpeg: &[u8]) -> bool {
            true
        }
    }
}

pub(crate) use window::Preview;
