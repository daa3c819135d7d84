//! Test doubles for the orchestrator's seams

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use kiln_core::domain::profile::{Profile, Provider};
use kiln_core::domain::service::{ImageKind, Service};
use kiln_core::dto::service::{CreateService, ServiceFilter};
use kiln_remote::{CommandOutput, Shell, ShellError};

use crate::job::Job;
use crate::probe::{HealthProbe, Ping};
use crate::repository::{ServiceStore, StoreError};
use crate::shell::ShellProvider;
use crate::tunnel::{TunnelError, Tunnels};

pub fn local_profile() -> Profile {
    Profile {
        name: "local".to_string(),
        host: None,
        user: None,
        home_dir: "/home/alice".to_string(),
        cache_dir: "/home/alice/.cache/huggingface".to_string(),
        provider: Some(Provider::Docker),
    }
}

pub fn slurm_profile() -> Profile {
    Profile {
        name: "della".to_string(),
        host: Some("della.princeton.edu".to_string()),
        user: Some("alice".to_string()),
        home_dir: "/home/alice".to_string(),
        cache_dir: "/scratch/gpfs/alice/hf".to_string(),
        provider: Some(Provider::Apptainer),
    }
}

pub fn request(profile: &str) -> CreateService {
    CreateService {
        name: "tgi-test".to_string(),
        image: ImageKind::TextGeneration,
        model: "bigscience/bloom-560m".to_string(),
        profile: profile.to_string(),
        job_type: None,
        grace_period: None,
        mounts: vec![],
        container_options: Default::default(),
        job_options: Default::default(),
    }
}

pub fn local_service() -> Service {
    Service::from_request(&request("local"), &local_profile())
}

pub fn slurm_service() -> Service {
    Service::from_request(&request("della"), &slurm_profile())
}

struct Rule {
    prefix: String,
    outputs: VecDeque<CommandOutput>,
}

/// Shell answering commands by prefix
///
/// Replies registered for the same prefix are served in order; the last one
/// repeats. Unmatched commands succeed with no output.
#[derive(Default)]
pub struct FakeShell {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    written: Mutex<Vec<(String, String)>>,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, prefix: &str, stdout: &str) {
        self.on_output(prefix, 0, stdout, "");
    }

    pub fn on_output(&self, prefix: &str, status: i32, stdout: &str, stderr: &str) {
        let output = CommandOutput {
            status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };

        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.outputs.push_back(output),
            None => rules.push(Rule {
                prefix: prefix.to_string(),
                outputs: VecDeque::from([output]),
            }),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Files written through the shell as `(path, contents)`
    pub fn written(&self) -> Vec<(String, String)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Shell for FakeShell {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        self.commands.lock().unwrap().push(command.to_string());

        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| command.starts_with(&r.prefix)) else {
            return Ok(CommandOutput::default());
        };

        let output = if rule.outputs.len() > 1 {
            rule.outputs.pop_front().unwrap_or_default()
        } else {
            rule.outputs.front().cloned().unwrap_or_default()
        };
        Ok(output)
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), ShellError> {
        self.written
            .lock()
            .unwrap()
            .push((path.to_string(), contents.to_string()));
        Ok(())
    }

    fn is_remote(&self) -> bool {
        false
    }
}

/// Hands out one shared `FakeShell` for every host
pub struct FakeShells {
    shell: Arc<FakeShell>,
    calls: AtomicUsize,
}

impl FakeShells {
    pub fn new(shell: Arc<FakeShell>) -> Self {
        Self {
            shell,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ShellProvider for FakeShells {
    fn shell(&self, _host: &str, _user: Option<&str>) -> Result<Arc<dyn Shell>, ShellError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.shell.clone())
    }
}

/// Records the job's port directly instead of forwarding
#[derive(Default)]
pub struct FakeTunnels {
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: AtomicBool,
}

impl FakeTunnels {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tunnels for FakeTunnels {
    async fn open(&self, service: &mut Service, job: &Job) -> Result<u16, TunnelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TunnelError::Spawn("forwarding refused".to_string()));
        }

        let port = job.port().unwrap_or(8080);
        service.port = Some(port);
        Ok(port)
    }

    async fn close(&self, service: &mut Service) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        service.port = None;
    }
}

/// Probe with a switchable answer
#[derive(Default)]
pub struct FakeProbe {
    ok: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn set_ok(&self, ok: bool) {
        self.ok.store(ok, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn ping(&self, _port: u16, _path: &str) -> Ping {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ok = self.ok.load(Ordering::SeqCst);
        Ping {
            ok,
            status: Some(if ok { 200 } else { 503 }),
        }
    }
}

/// In-memory `ServiceStore`
#[derive(Default)]
pub struct MemoryStore {
    services: Mutex<HashMap<Uuid, Service>>,
}

impl MemoryStore {
    pub fn insert(&self, service: Service) {
        self.services.lock().unwrap().insert(service.id, service);
    }

    pub fn snapshot(&self, id: Uuid) -> Option<Service> {
        self.services.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn add(&self, service: &Service) -> Result<(), StoreError> {
        self.insert(service.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Service>, StoreError> {
        Ok(self.snapshot(id))
    }

    async fn update(&self, service: &Service) -> Result<(), StoreError> {
        let mut services = self.services.lock().unwrap();
        match services.get_mut(&service.id) {
            Some(stored) => {
                *stored = service.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(service.id)),
        }
    }

    async fn list(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError> {
        let mut services: Vec<_> = self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        services.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(services)
    }

    async fn list_active(&self) -> Result<Vec<Service>, StoreError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut services = self.services.lock().unwrap();
        match services.get(&id) {
            None => Err(StoreError::NotFound(id)),
            Some(service) if !service.status.is_terminal() => {
                Err(StoreError::NotTerminal(id, service.status))
            }
            Some(_) => {
                services.remove(&id);
                Ok(())
            }
        }
    }
}
