use crate::render::TerminalRenderer;
use anyhow::{Context, Result};
use panelchat_core::render::{project, render_turn};
use panelchat_core::{
    AuthCoordinator, AuthState, BrowserContext, ClientSettings, ConversationClient,
    ConversationStore, FileStore, HttpRemote, IdentityStore, KeyValueStore, LoginOutcome,
    RemoteService, SendError, SignalBus, Turn, AUTH_SUCCESS_MARKER,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

const FAILURE_NOTICE: &str = "Something went wrong while sending your message. Please try again later.";

/// A line typed into the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    Message(String),
    Login,
    Logout,
    CancelLogin,
    Status,
    Signal(String),
    Reset,
    History,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

impl PanelCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Self::Message(trimmed.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "login" => Self::Login,
            "logout" => Self::Logout,
            "cancel-login" => Self::CancelLogin,
            "status" => Self::Status,
            "done" => Self::Signal(AUTH_SUCCESS_MARKER.to_string()),
            "signal" if !arg.is_empty() => Self::Signal(arg.to_string()),
            "reset" => Self::Reset,
            "history" => Self::History,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Results of background work, drained by the input loop.
#[derive(Debug)]
enum PanelEvent {
    Reply(Turn),
    Failed(SendError),
    Auth(AuthState),
}

/// Terminal front end: wires input to the core and renders its state.
pub struct Panel {
    chat: ConversationClient,
    auth: AuthCoordinator,
    signals: SignalBus,
    renderer: TerminalRenderer,
    greeting: String,
    /// The pending indicator is drawn and the cursor is still on its line.
    pending_line: AtomicBool,
    tx: UnboundedSender<PanelEvent>,
    rx: UnboundedReceiver<PanelEvent>,
}

impl Panel {
    pub async fn bootstrap(
        settings: &ClientSettings,
        browser: Arc<dyn BrowserContext>,
    ) -> Result<Self> {
        let storage: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&settings.data_dir)
                .await
                .with_context(|| format!("opening state in {}", settings.data_dir.display()))?,
        );
        let remote: Arc<dyn RemoteService> = Arc::new(
            HttpRemote::new(settings.base_url.clone(), settings.request_timeout)
                .context("building HTTP client")?,
        );
        Self::assemble(storage, remote, browser, &settings.greeting).await
    }

    /// Wires the core services over an opened storage backend and service.
    pub async fn assemble(
        storage: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteService>,
        browser: Arc<dyn BrowserContext>,
        greeting: &str,
    ) -> Result<Self> {
        let identity = IdentityStore::new(storage.clone());
        let client_id = identity
            .get_or_create()
            .await
            .context("resolving client identity")?;
        debug!(identity = %client_id, "client identity ready");

        let store = open_conversation(storage, greeting).await;
        let signals = SignalBus::new();
        let chat = ConversationClient::new(remote.clone(), identity.clone(), store);
        let auth = AuthCoordinator::new(remote, identity, browser, signals.clone());
        Ok(Self::new(chat, auth, signals, greeting.to_string()))
    }

    pub fn new(
        chat: ConversationClient,
        auth: AuthCoordinator,
        signals: SignalBus,
        greeting: String,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            chat,
            auth,
            signals,
            renderer: TerminalRenderer::default(),
            greeting,
            pending_line: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    pub fn auth(&self) -> &AuthCoordinator {
        &self.auth
    }

    pub fn chat(&self) -> &ConversationClient {
        &self.chat
    }

    pub async fn run(mut self) -> Result<()> {
        self.print_transcript();
        self.watch_auth();
        self.auth.check_status().await;
        println!("Type a message, or /help for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    // Enter already moved the cursor past the indicator.
                    self.pending_line.store(false, Ordering::SeqCst);
                    if !self.handle(PanelCommand::parse(&line)).await {
                        break;
                    }
                }
                Some(event) = self.rx.recv() => self.show(event),
            }
        }
        if self.chat.store().is_dirty() {
            if let Err(err) = self.chat.store().flush().await {
                warn!(%err, "conversation could not be saved before exit");
            }
        }
        Ok(())
    }

    /// Returns `false` when the panel should close.
    async fn handle(&self, command: PanelCommand) -> bool {
        match command {
            PanelCommand::Empty => {}
            PanelCommand::Message(text) => self.dispatch(text),
            PanelCommand::Login => match self.auth.login().await {
                Ok(LoginOutcome::Started) => {
                    println!("Finish signing in in the browser window, then type /done.")
                }
                Ok(LoginOutcome::AlreadyInFlight) => {
                    println!("A login window is already open. Use /cancel-login to start over.")
                }
                Err(err) => println!("Could not start login: {err}"),
            },
            PanelCommand::Logout => {
                if let Err(err) = self.auth.logout().await {
                    println!("Could not log out: {err}");
                }
            }
            PanelCommand::CancelLogin => {
                if !self.auth.cancel_login() {
                    println!("No login in progress.");
                }
            }
            PanelCommand::Status => {
                self.auth.check_status().await;
            }
            PanelCommand::Signal(payload) => {
                self.signals.post(payload);
            }
            PanelCommand::Reset => match self.chat.reset_conversation(&self.greeting).await {
                Ok(()) => self.print_transcript(),
                Err(err) => println!("Could not start over: {err}"),
            },
            PanelCommand::History => self.print_transcript(),
            PanelCommand::Help => print_help(),
            PanelCommand::Quit => return false,
            PanelCommand::Unknown(name) => println!("Unknown command /{name}. Try /help."),
        }
        true
    }

    fn dispatch(&self, text: String) {
        if self.chat.is_pending() {
            println!("(still waiting for the previous reply)");
            return;
        }
        self.draw_pending();
        let chat = self.chat.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = match chat.send(&text).await {
                Ok(reply) => PanelEvent::Reply(Turn::assistant(reply)),
                Err(err) => PanelEvent::Failed(err),
            };
            tx.send(event).ok();
        });
    }

    fn watch_auth(&self) {
        let mut states = self.auth.subscribe();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                if tx.send(PanelEvent::Auth(state)).is_err() {
                    break;
                }
            }
        });
    }

    fn draw_pending(&self) {
        print!("{}", self.renderer.pending_indicator());
        std::io::stdout().flush().ok();
        self.pending_line.store(true, Ordering::SeqCst);
    }

    fn show(&self, event: PanelEvent) {
        if self.pending_line.swap(false, Ordering::SeqCst) {
            print!("{}", self.renderer.clear_pending());
        }
        self.print_event(event);
        if self.chat.is_pending() {
            self.draw_pending();
        }
    }

    fn print_event(&self, event: PanelEvent) {
        match event {
            PanelEvent::Reply(turn) => {
                let rendered = render_turn(&turn, &self.renderer);
                println!("{}", self.renderer.frame(&rendered));
            }
            PanelEvent::Failed(SendError::EmptyMessage) => {}
            PanelEvent::Failed(SendError::Busy) => println!("(still waiting for the previous reply)"),
            PanelEvent::Failed(err) => {
                debug!(%err, "exchange failed");
                println!("{}", self.renderer.error_bubble(FAILURE_NOTICE));
            }
            PanelEvent::Auth(state) => println!("{}", auth_label(state)),
        }
    }

    pub fn print_transcript(&self) {
        for turn in project(&self.chat.store().history(), &self.renderer) {
            println!("{}", self.renderer.frame(&turn));
        }
    }
}

/// Restores the stored conversation. An unreadable record is replaced by a
/// fresh conversation on the next write; the greeting is only seeded when
/// nothing usable was stored.
async fn open_conversation(storage: Arc<dyn KeyValueStore>, greeting: &str) -> ConversationStore {
    let (store, restored) = match ConversationStore::load(storage.clone()).await {
        Ok(loaded) => loaded,
        Err(err) => {
            warn!(%err, "stored conversation unreadable; starting a new one");
            (ConversationStore::detached(storage, Default::default()), false)
        }
    };
    if !restored {
        store.seed_greeting(greeting).await;
    }
    store
}

pub fn auth_label(state: AuthState) -> &'static str {
    match state {
        AuthState::Unknown => "[account: checking…]",
        AuthState::Unauthenticated => "[account: signed out, /login to sign in]",
        AuthState::Authenticated => "[account: signed in, /logout to sign out]",
    }
}

fn print_help() {
    println!("/login         open the account login window");
    println!("/done          tell the panel the login window finished");
    println!("/signal <msg>  deliver a raw message from another window");
    println!("/cancel-login  abandon a pending login");
    println!("/logout        sign out");
    println!("/status        re-check sign-in status");
    println!("/reset         start a new conversation");
    println!("/history       show the transcript");
    println!("/quit          leave");
}
