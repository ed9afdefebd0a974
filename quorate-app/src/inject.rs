//! Desktop output sink: keystrokes via enigo, clipboard via arboard,
//! notifications via notify-rust.
//!
//! enigo and arboard handles are not reliably `Sync` across platforms, so a
//! dedicated worker thread owns both and serves requests over a channel.
//! The core's output writer already serializes callers; the channel just
//! keeps the OS handles on one thread.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use quorate_core::error::{QuorateError, Result};
use quorate_core::OutputSink;
use tracing::{error, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type Reply<T> = Sender<std::result::Result<T, String>>;

enum Request {
    Keys(String, Reply<()>),
    SetClipboard(String, Reply<()>),
    GetClipboard(Reply<String>),
    Paste(Reply<()>),
}

pub struct DesktopSink {
    tx: Sender<Request>,
}

impl DesktopSink {
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Request>();
        std::thread::Builder::new()
            .name("quorate-output".into())
            .spawn(move || worker(rx))
            .map_err(|e| QuorateError::Output(e.to_string()))?;
        Ok(Self { tx })
    }

    fn roundtrip<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| QuorateError::Output("output thread gone".into()))?;
        match reply_rx.recv_timeout(REPLY_TIMEOUT) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(QuorateError::Output(e)),
            Err(_) => Err(QuorateError::Output("output request timed out".into())),
        }
    }
}

impl OutputSink for DesktopSink {
    fn send_keystrokes(&self, text: &str) -> Result<()> {
        self.roundtrip(|reply| Request::Keys(text.to_string(), reply))
    }

    fn set_clipboard(&self, text: &str) -> Result<()> {
        self.roundtrip(|reply| Request::SetClipboard(text.to_string(), reply))
    }

    fn clipboard(&self) -> Result<String> {
        self.roundtrip(Request::GetClipboard)
    }

    fn paste_shortcut(&self) -> Result<()> {
        self.roundtrip(Request::Paste)
    }

    fn notify(&self, title: &str, body: &str) {
        if let Err(e) = notify_rust::Notification::new()
            .summary(title)
            .body(body)
            .show()
        {
            warn!("notification failed: {e}");
        }
    }

    fn busy_cue(&self) {
        #[cfg(target_os = "macos")]
        {
            let _ = std::process::Command::new("afplay")
                .arg("/System/Library/Sounds/Basso.aiff")
                .spawn();
        }
        #[cfg(not(target_os = "macos"))]
        {
            // Terminal bell; headless hosts at least get a log line.
            eprint!("\x07");
            warn!("recording trigger rejected: session busy");
        }
    }
}

fn worker(rx: Receiver<Request>) {
    let mut enigo = match Enigo::new(&Settings::default()) {
        Ok(e) => Some(e),
        Err(e) => {
            error!("keystroke backend unavailable: {e}");
            None
        }
    };
    let mut clipboard = match arboard::Clipboard::new() {
        Ok(c) => Some(c),
        Err(e) => {
            error!("clipboard unavailable: {e}");
            None
        }
    };

    while let Ok(request) = rx.recv() {
        match request {
            Request::Keys(text, reply) => {
                let result = match enigo.as_mut() {
                    Some(enigo) => enigo.text(&text).map_err(|e| e.to_string()),
                    None => Err("keystroke backend unavailable".into()),
                };
                let _ = reply.send(result);
            }
            Request::SetClipboard(text, reply) => {
                let result = match clipboard.as_mut() {
                    Some(clipboard) => clipboard.set_text(text).map_err(|e| e.to_string()),
                    None => Err("clipboard unavailable".into()),
                };
                let _ = reply.send(result);
            }
            Request::GetClipboard(reply) => {
                let result = match clipboard.as_mut() {
                    Some(clipboard) => clipboard.get_text().map_err(|e| e.to_string()),
                    None => Err("clipboard unavailable".into()),
                };
                let _ = reply.send(result);
            }
            Request::Paste(reply) => {
                let result = match enigo.as_mut() {
                    Some(enigo) => paste_chord(enigo).map_err(|e| e.to_string()),
                    None => Err("keystroke backend unavailable".into()),
                };
                let _ = reply.send(result);
            }
        }
    }
}

fn paste_chord(enigo: &mut Enigo) -> std::result::Result<(), enigo::InputError> {
    #[cfg(target_os = "macos")]
    let modifier = Key::Meta;
    #[cfg(not(target_os = "macos"))]
    let modifier = Key::Control;

    enigo.key(modifier, Direction::Press)?;
    enigo.key(Key::Unicode('v'), Direction::Click)?;
    enigo.key(modifier, Direction::Release)
}
