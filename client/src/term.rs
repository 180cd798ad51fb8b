use {
    crossterm::{
        QueueableCommand, cursor,
        style::{Color, ResetColor, SetForegroundColor},
        terminal,
    },
    once_cell::sync::Lazy,
    parking_lot::{Mutex, RawMutex, lock_api::ArcMutexGuard},
    std::{
        fmt::{self, Display, Write as _},
        io::{self, Stdout, Write},
        process,
        sync::Arc,
        time::Duration,
    },
    tokio::{runtime::Handle, select, signal::ctrl_c, sync::oneshot, time::interval},
    tracing::{
        Event, Level, Metadata, Subscriber,
        field::{Field, Visit},
        warn,
    },
    tracing_subscriber::{Layer, layer::Context},
};

struct Term {
    stdout: Stdout,
    current_status: Option<String>,
}

fn term() -> ArcMutexGuard<RawMutex, Term> {
    static TERM: Lazy<Arc<Mutex<Term>>> = Lazy::new(|| Arc::new(Mutex::new(Term::new())));
    Mutex::lock_arc(&TERM)
}

#[must_use]
pub struct StatusGuard;

impl StatusGuard {
    #[inline]
    pub fn set(&self, status: impl Display) {
        term().set_status(status).ok();
    }
}

impl Drop for StatusGuard {
    #[inline]
    fn drop(&mut self) {
        clear_status();
    }
}

/// Shows a status line below the log output until the guard is dropped.
#[inline]
pub fn set_status(status: impl Display) -> StatusGuard {
    term().set_status(status).ok();
    StatusGuard
}

#[inline]
pub fn clear_status() {
    term().clear_status().ok();
}

pub struct StatusUpdaterGuard(Option<oneshot::Sender<()>>);

impl Drop for StatusUpdaterGuard {
    #[inline]
    fn drop(&mut self) {
        if let Some(sender) = self.0.take() {
            sender.send(()).ok();
        }
    }
}

/// Refreshes the status line with `updater` every second until the guard is dropped.
#[inline]
pub fn set_status_updater(
    mut updater: impl FnMut() -> String + Send + 'static,
) -> StatusUpdaterGuard {
    let (sender, mut receiver) = oneshot::channel();
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(async move {
            let mut interval = interval(Duration::from_secs(1));
            let status = set_status(updater());
            loop {
                select! {
                    _ = interval.tick() => {
                        status.set(updater());
                    }
                    _ = &mut receiver => break,
                }
            }
        });
    }
    StatusUpdaterGuard(Some(sender))
}

#[expect(clippy::exit, reason = "interrupted by the user")]
async fn exit_on_interrupt() {
    match ctrl_c().await {
        Ok(()) => {
            clear_status();
            tracing::error!("Interrupted.");
            process::exit(1);
        }
        Err(err) => {
            warn!(?err, "failed to listen to interrupt signal");
        }
    }
}

impl Term {
    fn new() -> Self {
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(exit_on_interrupt());
        }
        Self {
            stdout: io::stdout(),
            current_status: None,
        }
    }

    fn set_status(&mut self, status: impl Display) -> io::Result<()> {
        let status = status.to_string();
        if self.current_status.is_none() {
            self.stdout.queue(cursor::Hide)?;
            self.stdout.queue(terminal::DisableLineWrap)?;
        } else {
            self.stdout.queue(cursor::RestorePosition)?;
            self.stdout
                .queue(terminal::Clear(terminal::ClearType::FromCursorDown))?;
        }
        self.stdout.queue(cursor::SavePosition)?;
        self.stdout.queue(SetForegroundColor(Color::DarkGreen))?;
        self.stdout.write_all(status.as_bytes())?;
        self.stdout.queue(ResetColor)?;
        self.stdout.queue(cursor::RestorePosition)?;
        self.stdout.flush()?;
        self.current_status = Some(status);
        Ok(())
    }

    fn clear_status(&mut self) -> io::Result<()> {
        if self.current_status.is_none() {
            return Ok(());
        }
        self.current_status = None;
        self.stdout.queue(cursor::RestorePosition)?;
        self.stdout
            .queue(terminal::Clear(terminal::ClearType::FromCursorDown))?;
        self.stdout.queue(terminal::EnableLineWrap)?;
        self.stdout.queue(cursor::Show)?;
        self.stdout.flush()
    }

    fn write(&mut self, color: Option<Color>, text: impl Display) -> io::Result<()> {
        let old_status = self.current_status.clone();
        self.clear_status()?;
        if let Some(color) = color {
            self.stdout.queue(SetForegroundColor(color))?;
        }
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.stdout.write_all(text.as_bytes())?;
        if color.is_some() {
            self.stdout.queue(ResetColor)?;
        }
        if let Some(old_status) = old_status {
            self.set_status(old_status)?;
        }
        self.stdout.flush()
    }
}

/// Prints events of this crate and the engine to the terminal. Warnings and errors are
/// red, debug output is grey.
pub struct TermLayer;

impl<S: Subscriber> Layer<S> for TermLayer {
    #[inline]
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        let mut fields = Vec::new();
        event.record(&mut DebugVisitor(&mut message, &mut fields));
        if !fields.is_empty() {
            write!(message, " ({})", fields.join(", ")).ok();
        }
        let level = *event.metadata().level();
        let color = if level == Level::ERROR || level == Level::WARN {
            Some(Color::Red)
        } else if level == Level::INFO {
            None
        } else {
            Some(Color::Grey)
        };
        term().write(color, message).ok();
    }

    #[inline]
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        metadata
            .module_path()
            .is_some_and(|path| path.starts_with("heddle"))
    }
}

struct DebugVisitor<'a>(&'a mut String, &'a mut Vec<String>);

impl Visit for DebugVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        } else {
            self.1.push(format!("{} = {value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            write!(self.0, "{value:?}").ok();
        } else {
            self.1.push(format!("{} = {value:?}", field.name()));
        }
    }
}
