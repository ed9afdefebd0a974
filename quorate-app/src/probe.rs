//! Frontmost-app and selection probing.
//!
//! macOS has the only full implementation (AppleScript via `osascript`,
//! clipboard round-trip for the selection). Other platforms report no
//! context, which the core treats as "window unchanged".

use quorate_core::{AppContext, ContextProbe};

#[derive(Default)]
pub struct DesktopProbe;

#[cfg(target_os = "macos")]
mod macos {
    use std::io::Write;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    use tracing::debug;

    const FRONTMOST_SCRIPT: &str = r#"
tell application "System Events"
    set frontApp to first application process whose frontmost is true
    set appName to name of frontApp
    set bundleId to bundle identifier of frontApp
    try
        set windowTitle to name of front window of frontApp
    on error
        set windowTitle to ""
    end try
    return appName & "|||" & bundleId & "|||" & windowTitle
end tell
"#;

    pub fn run_osascript(script: &str) -> Option<String> {
        let mut child = Command::new("osascript")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;
        child
            .stdin
            .as_mut()?
            .write_all(script.as_bytes())
            .ok()?;
        let output = child.wait_with_output().ok()?;
        if !output.status.success() {
            debug!("osascript exited with {:?}", output.status);
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    pub fn frontmost() -> Option<(String, String, String)> {
        let raw = run_osascript(FRONTMOST_SCRIPT)?;
        let mut parts = raw.splitn(3, "|||");
        let app = parts.next()?.to_string();
        let bundle = parts.next()?.to_string();
        let title = parts.next().unwrap_or_default().to_string();
        Some((app, title, bundle))
    }

    pub fn clipboard_text() -> Option<String> {
        let output = Command::new("pbpaste").output().ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn set_clipboard_text(text: &str) {
        if let Ok(mut child) = Command::new("pbcopy").stdin(Stdio::piped()).spawn() {
            if let Some(stdin) = child.stdin.as_mut() {
                let _ = stdin.write_all(text.as_bytes());
            }
            let _ = child.wait();
        }
    }

    /// Copy-selection round trip: save the clipboard, synthesize Cmd+C,
    /// compare, and always restore.
    pub fn selected_text() -> Option<String> {
        let original = clipboard_text();

        let copied = run_osascript(
            "tell application \"System Events\" to keystroke \"c\" using command down",
        );
        if copied.is_none() {
            return None;
        }
        std::thread::sleep(Duration::from_millis(60));
        let selection = clipboard_text();

        if let Some(original) = &original {
            set_clipboard_text(original);
        }

        let selection = selection?;
        let changed = original.as_deref() != Some(selection.as_str());
        (changed && !selection.trim().is_empty()).then_some(selection)
    }
}

impl ContextProbe for DesktopProbe {
    fn app_context(&self) -> Option<AppContext> {
        #[cfg(target_os = "macos")]
        {
            let (app, title, bundle) = macos::frontmost()?;
            return Some(AppContext::new(app, title, bundle));
        }
        #[cfg(not(target_os = "macos"))]
        {
            None
        }
    }

    fn selected_text(&self) -> Option<String> {
        #[cfg(target_os = "macos")]
        {
            return macos::selected_text();
        }
        #[cfg(not(target_os = "macos"))]
        {
            None
        }
    }
}
