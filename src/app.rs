use crate::client::{NAMESPACE_ALL, is_all_namespace};
use crate::config::Settings;
use crate::gvr::Selector;
use crate::input::Action;
use crate::model::ResourceKind;
use crate::port::{self, PortTunnel};
use crate::render::{RowEvent, TableData};
use crate::view::ViewKind;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Command,
    Filter,
    PortForward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    Refresh,
    /// The active view or its namespace changed; rebuild it.
    SwitchView,
    /// Look the pod up and open the forward prompt for it.
    PreparePortForward {
        path: String,
    },
    /// `specs` keeps the container list as typed, for validation against
    /// the pod's declared ports.
    StartPortForward {
        path: String,
        specs: String,
        tunnels: Vec<PortTunnel>,
    },
    StopPortForward {
        path: String,
        container: String,
        port_map: String,
    },
    StopPodForwards {
        path: String,
    },
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    prompt: String,
    command: AppCommand,
}

pub struct App {
    running: bool,
    mode: InputMode,
    input: String,
    status: String,
    context: String,
    cluster: String,
    user: String,
    namespace: String,
    last_namespace: String,
    views: Vec<ViewKind>,
    table: TableData,
    filter: String,
    labels: String,
    selected: usize,
    page_size: usize,
    show_help: bool,
    read_only: bool,
    port_forward_address: String,
    forward_target: Option<String>,
    pending_confirmation: Option<PendingConfirmation>,
}

impl App {
    pub fn new(context: String, cluster: String, user: String, namespace: String) -> Self {
        let kind = ViewKind::Resource(ResourceKind::Pods);
        let table = TableData::new(kind.header(), kind.scope(&namespace));
        let last_namespace = if is_all_namespace(&namespace) {
            "default".to_string()
        } else {
            namespace.clone()
        };
        Self {
            running: true,
            mode: InputMode::Normal,
            input: String::new(),
            status: "Ready".to_string(),
            context,
            cluster,
            user,
            namespace,
            last_namespace,
            views: vec![kind],
            table,
            filter: String::new(),
            labels: String::new(),
            selected: 0,
            page_size: 10,
            show_help: false,
            read_only: false,
            port_forward_address: crate::config::DEFAULT_PORT_FORWARD_ADDRESS.to_string(),
            forward_target: None,
            pending_confirmation: None,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Label selector applied to resource listings, empty for everything.
    pub fn labels(&self) -> &str {
        &self.labels
    }

    /// Label selector of the current view; labels are validated on entry.
    pub fn selector(&self) -> Selector {
        Selector::parse(&self.labels).unwrap_or_default()
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn pending_confirmation_prompt(&self) -> Option<&str> {
        self.pending_confirmation
            .as_ref()
            .map(|pending| pending.prompt.as_str())
    }

    pub fn view_kind(&self) -> &ViewKind {
        // The stack is never empty: `Back` keeps the root view.
        &self.views[self.views.len() - 1]
    }

    /// Breadcrumbs of the view stack, root first.
    pub fn crumbs(&self) -> Vec<String> {
        self.views.iter().map(ToString::to_string).collect()
    }

    pub fn table(&self) -> &TableData {
        &self.table
    }

    pub fn apply_settings(&mut self, settings: &Settings) {
        self.read_only = settings.read_only;
        self.port_forward_address = settings.port_forward_address.clone();
    }

    pub fn set_table(&mut self, table: TableData) {
        self.table = table;
        self.clamp_selection();
    }

    pub fn set_page_size(&mut self, rows: usize) {
        self.page_size = rows.max(1);
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = normalize_status_text(status.into());
    }

    /// Row keys after filtering, in display order.
    pub fn visible_keys(&self) -> Vec<String> {
        let needle = self.filter.to_ascii_lowercase();
        self.table
            .sorted_keys()
            .into_iter()
            .filter(|key| {
                needle.is_empty()
                    || self.table.rows.get(key).is_some_and(|row| {
                        row.fields
                            .iter()
                            .any(|cell| cell.to_ascii_lowercase().contains(&needle))
                    })
            })
            .collect()
    }

    pub fn visible_rows(&self) -> Vec<(String, &RowEvent)> {
        self.visible_keys()
            .into_iter()
            .filter_map(|key| {
                let row = self.table.rows.get(&key)?;
                Some((key, row))
            })
            .collect()
    }

    pub fn selected_index(&self) -> Option<usize> {
        let len = self.visible_keys().len();
        (len > 0).then(|| self.selected.min(len - 1))
    }

    pub fn selected_key(&self) -> Option<String> {
        let keys = self.visible_keys();
        let index = self.selected.min(keys.len().checked_sub(1)?);
        keys.into_iter().nth(index)
    }

    /// Opens the forward form for `path`, prefilled as `<container::port,...> <local,...>`.
    pub fn open_port_forward_prompt(&mut self, path: &str, specs: &str, ports: &str) {
        self.forward_target = Some(path.to_string());
        self.mode = InputMode::PortForward;
        self.input = format!("{specs} {ports}").trim().to_string();
        self.status = format!("Port-forward {path}: edit <container::port> <local> and press Enter");
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if let Some(pending) = self.pending_confirmation.take() {
            match action {
                Action::ConfirmYes | Action::EnterResource => {
                    self.status = format!("Confirmed: {}", pending.prompt);
                    return pending.command;
                }
                Action::ConfirmNo | Action::CancelInput | Action::Back => {
                    self.status = "Action cancelled".to_string();
                    return AppCommand::None;
                }
                _ => {
                    self.pending_confirmation = Some(pending);
                    self.status =
                        "Pending confirmation: press y to confirm or n to cancel".to_string();
                    return AppCommand::None;
                }
            }
        }

        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            Action::Down => {
                self.move_selection(1);
                AppCommand::None
            }
            Action::Up => {
                self.move_selection(-1);
                AppCommand::None
            }
            Action::PageDown => {
                self.move_selection(self.page_size as isize);
                AppCommand::None
            }
            Action::PageUp => {
                self.move_selection(-(self.page_size as isize));
                AppCommand::None
            }
            Action::Top => {
                self.selected = 0;
                AppCommand::None
            }
            Action::Bottom => {
                self.selected = self.visible_keys().len().saturating_sub(1);
                AppCommand::None
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::EnterResource => self.enter_selected(),
            Action::Back => self.back(),
            Action::StartCommand => {
                self.mode = InputMode::Command;
                self.input.clear();
                AppCommand::None
            }
            Action::StartFilter => {
                self.mode = InputMode::Filter;
                self.input = self.filter.clone();
                AppCommand::None
            }
            Action::Refresh => {
                self.status = format!("Refreshing {}", self.view_kind());
                AppCommand::Refresh
            }
            Action::ToggleAllNamespaces => {
                if is_all_namespace(&self.namespace) {
                    let previous = self.last_namespace.clone();
                    self.switch_namespace(&previous)
                } else {
                    self.switch_namespace(NAMESPACE_ALL)
                }
            }
            Action::StartPortForwardPrompt => self.prepare_port_forward(),
            Action::StopPortForward => self.prepare_stop_confirmation(),
            Action::ShowPortForwards => self.push_view(ViewKind::PortForwards),
            Action::SubmitInput => self.submit_input(),
            Action::CancelInput => {
                if self.mode != InputMode::Normal {
                    self.mode = InputMode::Normal;
                    self.input.clear();
                    self.forward_target = None;
                    self.status = "Input cancelled".to_string();
                }
                AppCommand::None
            }
            Action::Backspace => {
                self.input.pop();
                AppCommand::None
            }
            Action::InputChar(c) => {
                if self.mode != InputMode::Normal {
                    self.input.push(c);
                }
                AppCommand::None
            }
            Action::ConfirmYes | Action::ConfirmNo => AppCommand::None,
        }
    }

    fn move_selection(&mut self, delta: isize) {
        let visible_len = self.visible_keys().len();
        if visible_len == 0 {
            self.selected = 0;
            return;
        }

        let max_index = visible_len.saturating_sub(1) as isize;
        let current = self.selected.min(max_index as usize) as isize;
        self.selected = (current + delta).clamp(0, max_index) as usize;
    }

    fn clamp_selection(&mut self) {
        let visible_len = self.visible_keys().len();
        self.selected = self.selected.min(visible_len.saturating_sub(1));
    }

    fn reset_table(&mut self) {
        let kind = self.view_kind();
        self.table = TableData::new(kind.header(), kind.scope(&self.namespace));
        self.selected = 0;
    }

    fn push_view(&mut self, kind: ViewKind) -> AppCommand {
        if self.view_kind() == &kind {
            return AppCommand::None;
        }
        self.status = format!("Viewing {kind}");
        self.views.push(kind);
        self.filter.clear();
        self.labels.clear();
        self.reset_table();
        AppCommand::SwitchView
    }

    fn replace_view(&mut self, kind: ViewKind) -> AppCommand {
        self.status = format!("Viewing {kind}");
        self.views = vec![kind];
        self.filter.clear();
        self.labels.clear();
        self.reset_table();
        AppCommand::SwitchView
    }

    fn back(&mut self) -> AppCommand {
        if self.views.len() > 1 {
            self.views.pop();
            self.reset_table();
            self.status = format!("Viewing {}", self.view_kind());
            return AppCommand::SwitchView;
        }
        if !self.labels.is_empty() {
            self.labels.clear();
            self.reset_table();
            self.status = "Label selector cleared".to_string();
            return AppCommand::SwitchView;
        }
        if !self.filter.is_empty() {
            self.filter.clear();
            self.clamp_selection();
            self.status = "Filter cleared".to_string();
        }
        AppCommand::None
    }

    fn switch_namespace(&mut self, namespace: &str) -> AppCommand {
        let namespace = if is_all_namespace(namespace) {
            NAMESPACE_ALL.to_string()
        } else {
            self.last_namespace = namespace.to_string();
            namespace.to_string()
        };
        self.namespace = namespace;
        self.reset_table();
        self.status = format!("Namespace: {}", self.namespace);
        AppCommand::SwitchView
    }

    fn enter_selected(&mut self) -> AppCommand {
        let Some(key) = self.selected_key() else {
            self.status = "Nothing selected".to_string();
            return AppCommand::None;
        };

        if self.view_kind() == &ViewKind::Resource(ResourceKind::Namespaces) {
            let command = self.switch_namespace(&key);
            self.replace_view(ViewKind::Resource(ResourceKind::Pods));
            self.status = format!("Namespace: {}", self.namespace);
            return command;
        }

        match self.view_kind().drill(&key) {
            Some(kind) => self.push_view(kind),
            None => {
                self.status = format!("Nothing to open for {}", self.view_kind());
                AppCommand::None
            }
        }
    }

    fn prepare_port_forward(&mut self) -> AppCommand {
        if self.read_only {
            self.status = "Port-forward is disabled in read-only mode".to_string();
            return AppCommand::None;
        }
        if self.view_kind() != &ViewKind::Resource(ResourceKind::Pods) {
            self.status = "Port-forward is available in the Pods view".to_string();
            return AppCommand::None;
        }
        let Some(path) = self.selected_key() else {
            self.status = "No selected pod for port-forward".to_string();
            return AppCommand::None;
        };
        AppCommand::PreparePortForward { path }
    }

    fn prepare_stop_confirmation(&mut self) -> AppCommand {
        let Some(key) = self.selected_key() else {
            self.status = "No selected port-forward to stop".to_string();
            return AppCommand::None;
        };

        let (prompt, command) = match self.view_kind() {
            ViewKind::PortForwards => {
                let mut parts = key.rsplitn(3, '|');
                let (Some(port_map), Some(container), Some(path)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    self.status = format!("Malformed port-forward id {key}");
                    return AppCommand::None;
                };
                (
                    format!("Stop port-forward {path} {container} {port_map}"),
                    AppCommand::StopPortForward {
                        path: path.to_string(),
                        container: container.to_string(),
                        port_map: port_map.to_string(),
                    },
                )
            }
            ViewKind::Resource(ResourceKind::Pods) => (
                format!("Stop every port-forward of {key}"),
                AppCommand::StopPodForwards { path: key },
            ),
            _ => {
                self.status = "Stopping port-forwards works from Pods or PortForwards".to_string();
                return AppCommand::None;
            }
        };

        self.pending_confirmation = Some(PendingConfirmation {
            prompt: prompt.clone(),
            command,
        });
        self.status = format!("{prompt}? [y/n]");
        AppCommand::None
    }

    fn submit_input(&mut self) -> AppCommand {
        let line = self.input.trim().to_string();
        let mode = self.mode;
        self.mode = InputMode::Normal;
        self.input.clear();

        match mode {
            InputMode::Normal => AppCommand::None,
            InputMode::Filter => {
                if let Some(labels) = line.strip_prefix("-l") {
                    if let Err(error) = Selector::parse(labels) {
                        self.set_status(error.to_string());
                        return AppCommand::None;
                    }
                    self.labels = labels.trim().to_string();
                    self.filter.clear();
                    self.reset_table();
                    self.status = format!("Labels: '{}'", self.labels);
                    return AppCommand::SwitchView;
                }
                self.filter = line;
                self.clamp_selection();
                if self.filter.is_empty() {
                    self.status = "Filter cleared".to_string();
                } else {
                    self.status = format!("Filter: '{}'", self.filter);
                }
                AppCommand::None
            }
            InputMode::Command => self.execute_command_line(&line),
            InputMode::PortForward => {
                let Some(path) = self.forward_target.take() else {
                    return AppCommand::None;
                };
                self.submit_port_forward(path, &line)
            }
        }
    }

    fn submit_port_forward(&mut self, path: String, line: &str) -> AppCommand {
        let mut parts = line.split_whitespace();
        let (Some(specs), Some(ports), None) = (parts.next(), parts.next(), parts.next()) else {
            self.status = "Expected <container::port,...> <local,...>".to_string();
            return AppCommand::None;
        };

        match port::to_tunnels(&self.port_forward_address, specs, ports) {
            Ok(tunnels) if tunnels.is_empty() => {
                self.status = "No ports to forward".to_string();
                AppCommand::None
            }
            Ok(tunnels) => {
                let summary = tunnels
                    .iter()
                    .map(PortTunnel::port_map)
                    .collect::<Vec<_>>()
                    .join(",");
                self.status = format!("Starting port-forward {path} {summary}");
                AppCommand::StartPortForward {
                    path,
                    specs: specs.to_string(),
                    tunnels,
                }
            }
            Err(error) => {
                self.set_status(format!("Port-forward failed: {error}"));
                AppCommand::None
            }
        }
    }

    fn execute_command_line(&mut self, line: &str) -> AppCommand {
        let line = line.trim_start_matches(':').trim();
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            self.status = "No command entered".to_string();
            return AppCommand::None;
        };
        let arg = parts.next();

        match (head.to_ascii_lowercase().as_str(), arg) {
            ("q" | "quit" | "exit", _) => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            ("help", _) => {
                self.show_help = true;
                AppCommand::None
            }
            ("filter", value) => {
                self.filter = value.unwrap_or_default().to_string();
                self.clamp_selection();
                self.status = if self.filter.is_empty() {
                    "Filter cleared".to_string()
                } else {
                    format!("Filter: '{}'", self.filter)
                };
                AppCommand::None
            }
            ("ns" | "namespace", Some(namespace)) => {
                let command = self.switch_namespace(namespace);
                if !matches!(self.view_kind(), ViewKind::Resource(_)) {
                    self.replace_view(ViewKind::Resource(ResourceKind::Pods));
                }
                command
            }
            ("all", None) => self.switch_namespace(NAMESPACE_ALL),
            (token, namespace) => match ViewKind::from_command(token) {
                Some(kind) => {
                    if let Some(namespace) = namespace {
                        self.switch_namespace(namespace);
                    }
                    self.replace_view(kind)
                }
                None => {
                    self.set_status(format!("Unknown command: {line}"));
                    AppCommand::None
                }
            },
        }
    }
}

fn normalize_status_text(status: String) -> String {
    const MAX_STATUS_LEN: usize = 180;
    if status.chars().count() <= MAX_STATUS_LEN {
        return status;
    }

    let mut shortened = status
        .chars()
        .take(MAX_STATUS_LEN.saturating_sub(1))
        .collect::<String>();
    shortened.push('…');
    shortened
}
