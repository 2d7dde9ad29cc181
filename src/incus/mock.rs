//! In-memory container host for tests.
//!
//! Mirrors the observable behavior the control loops rely on: created
//! instances appear in listings, force-stopping an ephemeral instance
//! removes it, exec operations complete with a configurable exit code, and
//! events are injected by the test. Every mutating request is recorded so
//! tests can assert on the exact wire payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::mpsc;

use super::types::{
    Event, ExecPost, FileArgs, ImageAliasesEntry, ImageAliasesPost, ImagesPost, Instance,
    InstanceFull, InstanceState, InstanceStatePut, InstancesPost, Operation,
};
use super::{Error, EventStream, InstanceServer};

/// A recorded file write.
#[derive(Debug, Clone)]
pub struct FileWrite {
    pub instance: String,
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
    pub uid: i64,
    pub gid: i64,
    pub write_mode: String,
}

#[derive(Default)]
struct MockState {
    instances: Mutex<Vec<InstanceFull>>,
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    aliases: Mutex<HashMap<String, String>>,
    operations: Mutex<HashMap<String, Operation>>,
    exec_exit_codes: Mutex<HashMap<String, f64>>,

    created: Mutex<Vec<InstancesPost>>,
    execs: Mutex<Vec<(String, ExecPost)>>,
    state_changes: Mutex<Vec<(String, InstanceStatePut, String)>>,
    deleted: Mutex<Vec<String>>,
    file_writes: Mutex<Vec<FileWrite>>,
    alias_creates: Mutex<Vec<ImageAliasesPost>>,
    alias_deletes: Mutex<Vec<String>>,
    images_created: Mutex<Vec<ImagesPost>>,
    scoped_projects: Mutex<Vec<String>>,

    event_subscribers: Mutex<Vec<mpsc::Sender<Event>>>,

    fail_list: AtomicBool,
    fail_create: AtomicBool,
    fail_exec: AtomicBool,
    state_not_found: AtomicBool,
    default_exec_exit: Mutex<f64>,
    create_delay_ms: AtomicU64,
    op_counter: AtomicU64,
}

/// Scriptable in-memory [`InstanceServer`].
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<MockState>,
    project: Option<String>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a running instance created just now.
    pub fn add_instance(&self, name: &str) {
        self.add_instance_with(name, "Running", Duration::zero());
    }

    /// Seed an instance with an explicit status and age.
    pub fn add_instance_with(&self, name: &str, status: &str, age: Duration) {
        self.state.instances.lock().unwrap().push(InstanceFull {
            name: name.to_string(),
            created_at: Utc::now() - age,
            state: Some(InstanceState {
                status: status.to_string(),
            }),
        });
    }

    /// Seed an instance with no reported state.
    pub fn add_instance_stateless(&self, name: &str, age: Duration) {
        self.state.instances.lock().unwrap().push(InstanceFull {
            name: name.to_string(),
            created_at: Utc::now() - age,
            state: None,
        });
    }

    /// Set the content served for a file pull.
    pub fn set_file(&self, instance: &str, path: &str, content: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert((instance.to_string(), path.to_string()), content.to_vec());
    }

    /// Set the exit code returned by exec operations on an instance.
    pub fn set_exec_exit(&self, instance: &str, code: f64) {
        self.state
            .exec_exit_codes
            .lock()
            .unwrap()
            .insert(instance.to_string(), code);
    }

    /// Remove an instance from the listing, as an external delete would.
    pub fn remove_instance(&self, name: &str) {
        self.state
            .instances
            .lock()
            .unwrap()
            .retain(|i| i.name != name);
    }

    /// Exit code for exec operations on instances without an explicit one.
    pub fn set_default_exec_exit(&self, code: f64) {
        *self.state.default_exec_exit.lock().unwrap() = code;
    }

    /// Delay instance creation, to widen race windows in tests.
    pub fn set_create_delay(&self, delay: std::time::Duration) {
        self.state
            .create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Seed an existing image alias.
    pub fn add_alias(&self, name: &str, target: &str) {
        self.state
            .aliases
            .lock()
            .unwrap()
            .insert(name.to_string(), target.to_string());
    }

    pub fn fail_listings(&self, fail: bool) {
        self.state.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_execs(&self, fail: bool) {
        self.state.fail_exec.store(fail, Ordering::SeqCst);
    }

    /// Make state changes report the instance as already gone.
    pub fn state_changes_not_found(&self, not_found: bool) {
        self.state.state_not_found.store(not_found, Ordering::SeqCst);
    }

    /// Deliver an event to every open stream.
    pub fn push_event(&self, event: Event) {
        let mut subscribers = self.state.event_subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    /// Close all open event streams, simulating a dropped connection.
    pub fn drop_event_streams(&self) {
        self.state.event_subscribers.lock().unwrap().clear();
    }

    pub fn created_requests(&self) -> Vec<InstancesPost> {
        self.state.created.lock().unwrap().clone()
    }

    pub fn exec_requests(&self) -> Vec<(String, ExecPost)> {
        self.state.execs.lock().unwrap().clone()
    }

    pub fn state_changes(&self) -> Vec<(String, InstanceStatePut, String)> {
        self.state.state_changes.lock().unwrap().clone()
    }

    pub fn deleted_instances(&self) -> Vec<String> {
        self.state.deleted.lock().unwrap().clone()
    }

    pub fn file_writes(&self) -> Vec<FileWrite> {
        self.state.file_writes.lock().unwrap().clone()
    }

    pub fn alias_creates(&self) -> Vec<ImageAliasesPost> {
        self.state.alias_creates.lock().unwrap().clone()
    }

    pub fn alias_deletes(&self) -> Vec<String> {
        self.state.alias_deletes.lock().unwrap().clone()
    }

    pub fn images_created(&self) -> Vec<ImagesPost> {
        self.state.images_created.lock().unwrap().clone()
    }

    pub fn scoped_projects(&self) -> Vec<String> {
        self.state.scoped_projects.lock().unwrap().clone()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.state
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.name.clone())
            .collect()
    }

    fn transport_refused() -> Error {
        Error::Transport("connection refused".to_string())
    }

    fn complete_operation(&self, metadata: serde_json::Value) -> Operation {
        let id = format!(
            "op-{}",
            self.state.op_counter.fetch_add(1, Ordering::SeqCst)
        );
        let op = Operation {
            id: id.clone(),
            status: "Success".to_string(),
            status_code: 200,
            err: String::new(),
            metadata,
        };
        self.state.operations.lock().unwrap().insert(id, op.clone());
        op
    }
}

#[async_trait::async_trait]
impl InstanceServer for MockServer {
    async fn list_instances(&self) -> Result<Vec<Instance>, Error> {
        if self.state.fail_list.load(Ordering::SeqCst) {
            return Err(Self::transport_refused());
        }
        Ok(self
            .state
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|i| Instance {
                name: i.name.clone(),
                created_at: i.created_at,
            })
            .collect())
    }

    async fn list_instances_full(&self) -> Result<Vec<InstanceFull>, Error> {
        if self.state.fail_list.load(Ordering::SeqCst) {
            return Err(Self::transport_refused());
        }
        Ok(self.state.instances.lock().unwrap().clone())
    }

    async fn get_instance(&self, name: &str) -> Result<(Instance, String), Error> {
        let instances = self.state.instances.lock().unwrap();
        let found = instances
            .iter()
            .find(|i| i.name == name)
            .ok_or(Error::NotFound)?;
        Ok((
            Instance {
                name: found.name.clone(),
                created_at: found.created_at,
            },
            "mock-etag".to_string(),
        ))
    }

    async fn create_instance(&self, req: &InstancesPost) -> Result<Operation, Error> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Api {
                status: 500,
                message: "disk full".to_string(),
            });
        }
        let delay = self.state.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        {
            let instances = self.state.instances.lock().unwrap();
            if instances.iter().any(|i| i.name == req.name) {
                return Err(Error::Api {
                    status: 409,
                    message: format!("instance {} already exists", req.name),
                });
            }
        }
        self.state.created.lock().unwrap().push(req.clone());
        self.state.instances.lock().unwrap().push(InstanceFull {
            name: req.name.clone(),
            created_at: Utc::now(),
            state: Some(InstanceState {
                status: "Running".to_string(),
            }),
        });
        Ok(self.complete_operation(serde_json::Value::Null))
    }

    async fn create_instance_file(
        &self,
        instance: &str,
        path: &str,
        content: &[u8],
        args: &FileArgs,
    ) -> Result<(), Error> {
        self.state.file_writes.lock().unwrap().push(FileWrite {
            instance: instance.to_string(),
            path: path.to_string(),
            content: content.to_vec(),
            mode: args.mode,
            uid: args.uid,
            gid: args.gid,
            write_mode: args.write_mode.clone(),
        });
        self.state
            .files
            .lock()
            .unwrap()
            .insert((instance.to_string(), path.to_string()), content.to_vec());
        Ok(())
    }

    async fn read_instance_file(&self, instance: &str, path: &str) -> Result<Vec<u8>, Error> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(&(instance.to_string(), path.to_string()))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn exec_instance(&self, instance: &str, req: &ExecPost) -> Result<Operation, Error> {
        if self.state.fail_exec.load(Ordering::SeqCst) {
            return Err(Self::transport_refused());
        }
        self.state
            .execs
            .lock()
            .unwrap()
            .push((instance.to_string(), req.clone()));
        let exit = self
            .state
            .exec_exit_codes
            .lock()
            .unwrap()
            .get(instance)
            .copied()
            .unwrap_or_else(|| *self.state.default_exec_exit.lock().unwrap());
        Ok(self.complete_operation(serde_json::json!({ "return": exit })))
    }

    async fn update_instance_state(
        &self,
        instance: &str,
        req: &InstanceStatePut,
        etag: &str,
    ) -> Result<Operation, Error> {
        if self.state.state_not_found.load(Ordering::SeqCst) {
            return Err(Error::NotFound);
        }
        self.state.state_changes.lock().unwrap().push((
            instance.to_string(),
            req.clone(),
            etag.to_string(),
        ));
        if req.action == "stop" {
            // Ephemeral instances vanish on stop.
            self.state
                .instances
                .lock()
                .unwrap()
                .retain(|i| i.name != instance);
        }
        Ok(self.complete_operation(serde_json::Value::Null))
    }

    async fn delete_instance(&self, instance: &str) -> Result<Operation, Error> {
        self.state.deleted.lock().unwrap().push(instance.to_string());
        self.state
            .instances
            .lock()
            .unwrap()
            .retain(|i| i.name != instance);
        Ok(self.complete_operation(serde_json::Value::Null))
    }

    async fn wait_operation(&self, id: &str) -> Result<Operation, Error> {
        self.state
            .operations
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn get_operation(&self, id: &str) -> Result<Operation, Error> {
        self.wait_operation(id).await
    }

    async fn events(&self) -> Result<EventStream, Error> {
        let (tx, rx) = mpsc::channel(16);
        self.state.event_subscribers.lock().unwrap().push(tx);
        Ok(EventStream::new(rx))
    }

    async fn create_image(&self, req: &ImagesPost) -> Result<Operation, Error> {
        self.state.images_created.lock().unwrap().push(req.clone());
        Ok(self.complete_operation(serde_json::json!({
            "fingerprint": "0123456789abcdef",
            "progress": {"percent": "100"},
        })))
    }

    async fn get_image_alias(&self, name: &str) -> Result<ImageAliasesEntry, Error> {
        self.state
            .aliases
            .lock()
            .unwrap()
            .get(name)
            .map(|target| ImageAliasesEntry {
                name: name.to_string(),
                target: target.clone(),
            })
            .ok_or(Error::NotFound)
    }

    async fn delete_image_alias(&self, name: &str) -> Result<(), Error> {
        self.state.alias_deletes.lock().unwrap().push(name.to_string());
        self.state
            .aliases
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    async fn create_image_alias(&self, req: &ImageAliasesPost) -> Result<(), Error> {
        self.state.alias_creates.lock().unwrap().push(req.clone());
        self.state
            .aliases
            .lock()
            .unwrap()
            .insert(req.name.clone(), req.target.clone());
        Ok(())
    }

    fn with_project(&self, project: &str) -> Arc<dyn InstanceServer> {
        self.state
            .scoped_projects
            .lock()
            .unwrap()
            .push(project.to_string());
        let mut scoped = self.clone();
        scoped.project = Some(project.to_string());
        Arc::new(scoped)
    }
}
