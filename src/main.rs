mod app;
mod cli;
mod client;
mod config;
mod error;
mod forward;
mod forwarders;
mod gvr;
mod input;
mod model;
mod port;
mod rbac;
mod render;
mod resources;
mod task;
mod ui;
mod view;
mod watch;

use anyhow::{Context, Result};
use app::{App, AppCommand};
use clap::Parser;
use cli::CliArgs;
use client::{
    ALL_NAMESPACES, Connection, KubeConnection, NAMESPACE_ALL, fqn, is_all_namespace, namespaced,
};
use config::{RuntimeConfigWatcher, Settings};
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use error::{EngineError, EngineResult};
use forward::{ForwardEvent, PortForwarder};
use forwarders::Forwarder;
use futures::StreamExt;
use gvr::{Gvr, Selector};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use model::ResourceKind;
use port::{ContainerPortSpecs, PortTunnel};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use render::TableData;
use resources::{decode, pod_phase, pod_port_specs};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::path::Path;
use std::sync::Arc;
use task::ScheduledTask;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use view::{View, ViewKind};
use watch::Factory;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

enum ViewOutcome {
    Refreshed(TableData),
    Failed { empty: TableData, error: EngineError },
}

/// Result of one refresh, tagged with the view generation that produced it.
struct ViewUpdate {
    generation: u64,
    outcome: ViewOutcome,
}

/// Results of cluster reads started from the update loop.
enum LoopEvent {
    Form {
        path: String,
        result: Result<ForwardForm>,
    },
    Sweep {
        stale: Vec<String>,
        candidates: Vec<AutoCandidate>,
    },
}

/// A running pod asking to be forwarded through its annotation.
struct AutoCandidate {
    path: String,
    tunnels: EngineResult<Vec<PortTunnel>>,
}

/// The active view and the timer that refreshes it.
struct ViewRunner {
    generation: u64,
    view: Arc<Mutex<View>>,
    task: ScheduledTask,
}

impl ViewRunner {
    fn spawn(
        generation: u64,
        view: View,
        factory: &Arc<Factory>,
        parent: &CancellationToken,
        period: Duration,
        updates: &mpsc::UnboundedSender<ViewUpdate>,
    ) -> Self {
        let view = Arc::new(Mutex::new(view));
        let task = schedule_refresh(generation, &view, factory, parent, period, updates);
        Self {
            generation,
            view,
            task,
        }
    }
}

fn schedule_refresh(
    generation: u64,
    view: &Arc<Mutex<View>>,
    factory: &Arc<Factory>,
    parent: &CancellationToken,
    period: Duration,
    updates: &mpsc::UnboundedSender<ViewUpdate>,
) -> ScheduledTask {
    let view = Arc::clone(view);
    let factory = Arc::clone(factory);
    let updates = updates.clone();
    ScheduledTask::spawn(
        &format!("view-{generation}"),
        period,
        parent,
        move || {
            let view = Arc::clone(&view);
            let factory = Arc::clone(&factory);
            let updates = updates.clone();
            async move {
                let mut view = view.lock().await;
                let outcome = match view.refresh(&factory).await {
                    Ok(table) => ViewOutcome::Refreshed(table),
                    Err(error) => {
                        debug!(view = %view.kind(), namespace = view.namespace(), "refresh failed");
                        ViewOutcome::Failed {
                            empty: view.empty(),
                            error,
                        }
                    }
                };
                let _ = updates.send(ViewUpdate {
                    generation,
                    outcome,
                });
            }
        },
    )
}

/// Everything the update loop owns besides the terminal and the app state.
struct Runtime {
    factory: Arc<Factory>,
    args: CliArgs,
    settings: Settings,
    config: RuntimeConfigWatcher,
    stop: CancellationToken,
    view_tx: mpsc::UnboundedSender<ViewUpdate>,
    forward_tx: mpsc::UnboundedSender<ForwardEvent>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    runner: ViewRunner,
    sweeping: bool,
    auto_forwarded: HashSet<String>,
    /// Declared ports of the pod whose forward form is open.
    form_specs: Option<ContainerPortSpecs>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter, args.log_file.as_deref())?;

    let mut config = RuntimeConfigWatcher::discover();
    let settings = config
        .load_current()
        .unwrap_or_else(|error| {
            warn!("ignoring runtime config: {}", compact_error(&error));
            Settings::default()
        })
        .with_overrides(&args);

    let connection = KubeConnection::new(args.context.clone()).await?;
    let namespace = resolve_namespace(&args, connection.default_namespace());
    if args.all_namespaces && args.namespace.is_some() {
        warn!("both --all-namespaces and --namespace were provided, using all namespaces");
    }

    let mut app = App::new(
        connection.context().to_string(),
        connection.cluster().to_string(),
        connection.user().to_string(),
        namespace.clone(),
    );
    app.apply_settings(&settings);

    let factory = Arc::new(Factory::new(Arc::new(connection)));
    factory.set_active_ns(&namespace);
    factory.start(&namespace);
    info!(namespace, refresh_ms = settings.refresh_ms, "kview started");
    tokio::spawn({
        let factory = Arc::clone(&factory);
        async move {
            factory.wait_for_cache_sync().await;
            debug!("initial caches synced");
        }
    });

    let result = run(&mut app, Arc::clone(&factory), args, settings, config).await;
    factory.terminate();
    result
}

fn init_tracing(level_filter: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();
    let _ = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::sink).try_init(),
    };

    Ok(())
}

fn resolve_namespace(args: &CliArgs, default_namespace: &str) -> String {
    if args.all_namespaces {
        NAMESPACE_ALL.to_string()
    } else if let Some(namespace) = &args.namespace {
        namespace.clone()
    } else {
        default_namespace.to_string()
    }
}

async fn run(
    app: &mut App,
    factory: Arc<Factory>,
    args: CliArgs,
    settings: Settings,
    config: RuntimeConfigWatcher,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, factory, args, settings, config).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALL_KEYS_AS_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
                    | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    factory: Arc<Factory>,
    args: CliArgs,
    settings: Settings,
    config: RuntimeConfigWatcher,
) -> Result<()> {
    let stop = CancellationToken::new();
    let (view_tx, mut view_rx) = mpsc::unbounded_channel::<ViewUpdate>();
    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<ForwardEvent>();
    let (loop_tx, mut loop_rx) = mpsc::unbounded_channel::<LoopEvent>();
    let period = Duration::from_millis(settings.refresh_ms);
    register_watches(&factory, app.view_kind(), app.namespace());
    let runner = ViewRunner::spawn(
        0,
        View::new(app.view_kind().clone(), app.namespace()).with_selector(app.selector()),
        &factory,
        &stop,
        period,
        &view_tx,
    );
    let mut runtime = Runtime {
        factory,
        args,
        settings,
        config,
        stop,
        view_tx,
        forward_tx,
        loop_tx,
        runner,
        sweeping: false,
        auto_forwarded: HashSet::new(),
        form_specs: None,
    };

    app.set_status(format!("Loading {}…", app.view_kind()));
    let mut reader = EventStream::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            runtime.execute(app, command);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            maybe_update = view_rx.recv() => {
                if let Some(update) = maybe_update
                    && update.generation == runtime.runner.generation
                {
                    apply_view_update(app, update.outcome);
                }
            }
            maybe_event = forward_rx.recv() => {
                if let Some(event) = maybe_event {
                    runtime.on_forward_event(app, event);
                }
            }
            maybe_event = loop_rx.recv() => {
                if let Some(event) = maybe_event {
                    runtime.on_loop_event(app, event);
                }
            }
            _ = ticker.tick() => {
                if let Some(refresh_ms) = runtime.housekeeping(app) {
                    ticker = interval(Duration::from_millis(refresh_ms));
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
            }
        }
    }

    runtime.stop.cancel();
    Ok(())
}

/// Registers and starts the watches `kind` reads in `namespace`. Refresh
/// tasks only look watches up, so this runs on the update loop first.
fn register_watches(factory: &Factory, kind: &ViewKind, namespace: &str) {
    for (scope, gvr) in kind.watches(namespace) {
        let scope = if is_all_namespace(&scope) {
            ALL_NAMESPACES
        } else {
            scope.as_str()
        };
        if let Err(error) = factory.for_resource(scope, &gvr) {
            warn!(gvr = %gvr, namespace = scope, "cannot watch resource: {error}");
        }
    }
}

fn register_pods(factory: &Factory, namespace: &str) {
    register_watches(factory, &ViewKind::Resource(ResourceKind::Pods), namespace);
}

fn apply_view_update(app: &mut App, outcome: ViewOutcome) {
    match outcome {
        ViewOutcome::Refreshed(table) => {
            if app.status().starts_with("Loading") {
                app.set_status(format!("Viewing {}", app.view_kind()));
            }
            app.set_table(table);
        }
        ViewOutcome::Failed { empty, error } => {
            warn!(view = %app.view_kind(), "refresh failed: {error}");
            if error.is_access_error() {
                app.set_table(empty);
            }
            app.set_status(format!("{} refresh failed: {error}", app.view_kind()));
        }
    }
}

impl Runtime {
    fn period(&self) -> Duration {
        Duration::from_millis(self.settings.refresh_ms)
    }

    fn switch_view(&mut self, app: &App) {
        if !is_all_namespace(app.namespace()) {
            self.factory.set_active_ns(app.namespace());
        }
        debug!(
            task = self.runner.task.name(),
            finished = self.runner.task.is_finished(),
            "replacing view refresh"
        );
        register_watches(&self.factory, app.view_kind(), app.namespace());
        let selector = app.selector();
        debug!(%selector, "label selector");
        let generation = self.runner.generation + 1;
        self.runner = ViewRunner::spawn(
            generation,
            View::new(app.view_kind().clone(), app.namespace()).with_selector(selector),
            &self.factory,
            &self.stop,
            self.period(),
            &self.view_tx,
        );
        debug!(generation, view = %app.view_kind(), namespace = app.namespace(), "view switched");
    }

    /// Restarts the refresh timer of the current view; its first tick is
    /// immediate and the reconciler keeps its cache.
    fn refresh_now(&mut self) {
        self.runner.task = schedule_refresh(
            self.runner.generation,
            &self.runner.view,
            &self.factory,
            &self.stop,
            self.period(),
            &self.view_tx,
        );
    }

    fn execute(&mut self, app: &mut App, command: AppCommand) {
        match command {
            AppCommand::None => {}
            AppCommand::Refresh => {
                self.factory.client().reset_access();
                self.refresh_now();
            }
            AppCommand::SwitchView => self.switch_view(app),
            AppCommand::PreparePortForward { path } => {
                register_pods(&self.factory, &namespaced(&path).0);
                let factory = Arc::clone(&self.factory);
                let address = self.settings.port_forward_address.clone();
                let events = self.loop_tx.clone();
                app.set_status(format!("Loading ports of {path}…"));
                tokio::spawn(async move {
                    let result = forward_form(&factory, &path, &address).await;
                    let _ = events.send(LoopEvent::Form { path, result });
                });
            }
            AppCommand::StartPortForward {
                path,
                specs,
                tunnels,
            } => {
                let declared = self.form_specs.take().unwrap_or_default();
                match declared.undeclared(&specs) {
                    Some(entry) => app.set_status(format!(
                        "Port-forward {path}: {entry} is not a declared port"
                    )),
                    None => self.start_forwards(app, &path, tunnels),
                }
            }
            AppCommand::StopPortForward {
                path,
                container,
                port_map,
            } => {
                if self.factory.kill_forwarder(&path, &container, &port_map) {
                    app.set_status(format!("Stopped port-forward {path} {port_map}"));
                } else {
                    app.set_status(format!("No port-forward {path} {port_map}"));
                }
                self.refresh_now();
            }
            AppCommand::StopPodForwards { path } => {
                let count = self.factory.delete_forwarder(&path);
                app.set_status(format!("Stopped {count} port-forward(s) for {path}"));
                self.refresh_now();
            }
        }
    }

    fn on_loop_event(&mut self, app: &mut App, event: LoopEvent) {
        match event {
            LoopEvent::Form { path, result } => match result {
                Ok(ForwardForm::Auto(tunnels)) => self.start_forwards(app, &path, tunnels),
                Ok(ForwardForm::Prompt {
                    specs,
                    ports,
                    declared,
                }) => {
                    self.form_specs = Some(declared);
                    app.open_port_forward_prompt(&path, &specs, &ports);
                    if self.factory.is_pod_forwarded(&path) {
                        app.set_status(format!(
                            "{path} is already forwarded, press p to list its port-forwards"
                        ));
                    }
                }
                Err(error) => app.set_status(format!(
                    "Port-forward unavailable for {path}: {}",
                    compact_error(&error)
                )),
            },
            LoopEvent::Sweep { stale, candidates } => {
                self.sweeping = false;
                let stopped = self.factory.prune_forwarders(&stale);
                if stopped > 0 {
                    app.set_status(format!("Stopped {stopped} stale port-forward(s)"));
                    if matches!(app.view_kind(), ViewKind::PortForwards) {
                        self.refresh_now();
                    }
                }
                for candidate in candidates {
                    self.auto_forward(app, candidate);
                }
            }
        }
    }

    fn start_forwards(&self, app: &mut App, path: &str, tunnels: Vec<PortTunnel>) {
        if tunnels.is_empty() {
            app.set_status(format!("No free ports to forward for {path}"));
            return;
        }
        if let Err(error) = port::check_available(&tunnels) {
            app.set_status(format!("Port-forward failed: {error}"));
            return;
        }
        register_pods(&self.factory, &namespaced(path).0);

        for tunnel in tunnels {
            let factory = Arc::clone(&self.factory);
            let stop = self.stop.clone();
            let events = self.forward_tx.clone();
            let path = path.to_string();
            tokio::spawn(async move {
                let event =
                    match PortForwarder::start(&factory, &path, tunnel.clone(), &stop, events.clone())
                        .await
                    {
                        Ok(session) => ForwardEvent::Started(session),
                        Err(error) => ForwardEvent::Failed {
                            path,
                            tunnel,
                            error,
                        },
                    };
                let _ = events.send(event);
            });
        }
        app.set_status(format!("Starting port-forward {path}…"));
    }

    fn on_forward_event(&mut self, app: &mut App, event: ForwardEvent) {
        match event {
            ForwardEvent::Started(session) => {
                let target = format!(
                    "{} {}:{}",
                    session.path(),
                    session.address(),
                    session.port_map()
                );
                if *session.ready().borrow() {
                    self.factory.add_forwarder(session);
                    app.set_status(format!("Port-forward started {target}"));
                } else {
                    app.set_status(format!("Port-forward closed before it started {target}"));
                }
            }
            ForwardEvent::Failed {
                path,
                tunnel,
                error,
            } => {
                warn!(path, ports = tunnel.port_map(), "port-forward failed: {error}");
                app.set_status(format!(
                    "Port-forward failed {path} {}: {error}",
                    tunnel.port_map()
                ));
            }
            ForwardEvent::Closed { session, error } => {
                let retired = self.factory.retire_forwarder(&session);
                if let Some(error) = error {
                    app.set_status(format!(
                        "Port-forward {} {} closed: {error}",
                        session.path(),
                        session.port_map()
                    ));
                } else if retired {
                    debug!(path = session.path(), "retired closed port-forward");
                }
            }
        }
        if matches!(app.view_kind(), ViewKind::PortForwards) {
            self.refresh_now();
        }
    }

    /// Periodic work: settings reload on the loop, then a background sweep
    /// for stale tunnels and auto-forward pods. Returns a new refresh period
    /// when it changed.
    fn housekeeping(&mut self, app: &mut App) -> Option<u64> {
        let mut period_changed = None;
        match self.config.reload_if_changed() {
            Ok(Some(next)) => {
                let next = next.with_overrides(&self.args);
                if next.refresh_ms != self.settings.refresh_ms {
                    period_changed = Some(next.refresh_ms);
                }
                app.apply_settings(&next);
                app.set_status(format!(
                    "Settings reloaded from {}",
                    next.source.as_deref().unwrap_or("defaults")
                ));
                self.settings = next;
                if period_changed.is_some() {
                    self.refresh_now();
                }
            }
            Ok(None) => {}
            Err(error) => {
                app.set_status(format!("Settings reload failed: {}", compact_error(&error)))
            }
        }

        if !self.sweeping {
            self.sweep(app);
        }
        period_changed
    }

    /// Looks for stale tunnels and auto-forward pods off the loop. The pod
    /// watches it reads are registered here first.
    fn sweep(&mut self, app: &App) {
        let namespace = app.namespace().to_string();
        let auto = self.settings.auto_forward && !self.settings.read_only;
        if auto {
            register_pods(&self.factory, &namespace);
        }
        for forwarder in self.factory.forwarders() {
            register_pods(&self.factory, &namespaced(forwarder.path()).0);
        }

        self.sweeping = true;
        let factory = Arc::clone(&self.factory);
        let address = self.settings.port_forward_address.clone();
        let events = self.loop_tx.clone();
        tokio::spawn(async move {
            let stale = factory.stale_port_forwards().await;
            let candidates = if auto {
                auto_candidates(&factory, &namespace, &address).await
            } else {
                Vec::new()
            };
            let _ = events.send(LoopEvent::Sweep { stale, candidates });
        });
    }

    /// Forwards a pod carrying the auto-forward annotation once, the first
    /// time it is seen running.
    fn auto_forward(&mut self, app: &mut App, candidate: AutoCandidate) {
        let AutoCandidate { path, tunnels } = candidate;
        if !self.auto_forwarded.insert(path.clone()) {
            return;
        }
        match tunnels {
            Ok(mut tunnels) => {
                tunnels.retain(|tunnel| !self.factory.is_container_forwarded(&path, &tunnel.container));
                info!(path, tunnels = tunnels.len(), "auto port-forward");
                self.start_forwards(app, &path, tunnels);
            }
            Err(error) => warn!(path, "invalid auto port-forward annotation: {error}"),
        }
    }
}

/// Reads the pod behind `path` and decides between forwarding it right away
/// and prompting for ports.
async fn forward_form(factory: &Factory, path: &str, address: &str) -> Result<ForwardForm> {
    let object = factory
        .get(&Gvr::pods(), path, true, &Selector::everything())
        .await?;
    let pod: Pod = decode(&object)?;
    let declared = pod_port_specs(&pod);
    if declared.is_empty() {
        anyhow::bail!("no TCP container ports declared");
    }

    let annotations = pod.metadata.annotations.as_ref();
    if let Some(tunnels) = port::auto_tunnels(annotations, &declared, address)? {
        return Ok(ForwardForm::Auto(tunnels));
    }

    let preferred = port::preferred_ports(annotations, &declared)?;
    let (specs, ports) = if preferred.is_empty() {
        debug!(path, ports = %declared.dump(), "forward annotation matched no declared port");
        let tunnels = declared.to_tunnels(address);
        let specs = tunnels
            .iter()
            .map(|tunnel| format!("{}::{}", tunnel.container, tunnel.container_port))
            .collect::<Vec<_>>();
        let ports = tunnels
            .iter()
            .map(|tunnel| tunnel.local_port.to_string())
            .collect::<Vec<_>>();
        (specs.join(","), ports.join(","))
    } else {
        preferred.to_port_spec(&declared)
    };
    Ok(ForwardForm::Prompt {
        specs,
        ports,
        declared,
    })
}

/// Running pods of `namespace` whose annotations ask for auto-forwarding.
async fn auto_candidates(factory: &Factory, namespace: &str, address: &str) -> Vec<AutoCandidate> {
    let objects = match factory
        .list(&Gvr::pods(), namespace, false, &Selector::everything())
        .await
    {
        Ok(objects) => objects,
        Err(error) => {
            debug!(namespace, "auto-forward scan skipped: {error}");
            return Vec::new();
        }
    };

    objects
        .iter()
        .filter_map(|object| {
            let pod = decode::<Pod>(object).ok()?;
            if pod_phase(&pod) != "Running" {
                return None;
            }
            let specs = pod_port_specs(&pod);
            let tunnels =
                port::auto_tunnels(pod.metadata.annotations.as_ref(), &specs, address).transpose()?;
            Some(AutoCandidate {
                path: fqn(&object.namespace().unwrap_or_default(), &object.name_any()),
                tunnels,
            })
        })
        .collect()
}

enum ForwardForm {
    Auto(Vec<PortTunnel>),
    Prompt {
        specs: String,
        ports: String,
        declared: ContainerPortSpecs,
    },
}

fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}
