use tracing::debug;
use versa_core::reference::extract_references;
use versa_core::{Bundle, BundleEntry, BundleType, Method, RequestUrl, Resource};

use crate::command::{
    CheckReferencesCommand, Command, CommandKind, CreateCommand, DeleteCommand, ReadCommand,
    ResolveReferencesCommand, UpdateCommand,
};
use crate::config::EngineConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Batch,
    Transaction,
}

/// The commands built from one bundle, in entry order.
#[derive(Debug)]
pub struct CommandList {
    pub mode: ExecutionMode,
    pub commands: Vec<Command>,
    pub entry_count: usize,
}

impl CommandList {
    pub fn is_read_only(&self) -> bool {
        !self.commands.iter().any(Command::is_modifying)
    }
}

/// Translates bundle entries into commands. Every malformed entry is
/// rejected here, before any command runs.
pub struct CommandFactory<'a> {
    config: &'a EngineConfig,
}

impl<'a> CommandFactory<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, bundle: &Bundle) -> Result<CommandList, EngineError> {
        let mode = match bundle.bundle_type {
            Some(BundleType::Batch) => ExecutionMode::Batch,
            Some(BundleType::Transaction) => ExecutionMode::Transaction,
            Some(other) => {
                return Err(EngineError::bad_request(format!(
                    "bundle type {} is not supported, expected batch or transaction",
                    other.as_str()
                )));
            }
            None => return Err(EngineError::bad_request("missing bundle type")),
        };

        let mut commands = Vec::with_capacity(bundle.entries.len());
        for (index, entry) in bundle.entries.iter().enumerate() {
            self.build_entry(index, entry, &mut commands)?;
        }
        debug!(
            target: "versa::command",
            entries = bundle.entries.len(),
            commands = commands.len(),
            ?mode,
            "built commands"
        );
        Ok(CommandList {
            mode,
            commands,
            entry_count: bundle.entries.len(),
        })
    }

    fn build_entry(&self, index: usize, entry: &BundleEntry, commands: &mut Vec<Command>) -> Result<(), EngineError> {
        let request = &entry.request;
        let url = RequestUrl::parse(&request.url)
            .map_err(|e| EngineError::bad_request(format!("entry {index}: {e}")))?;

        match (request.method, &entry.resource) {
            (Method::Get, None) => commands.push(Command::new(
                index,
                CommandKind::Read(ReadCommand::new(
                    index,
                    url,
                    request.if_none_match.clone(),
                    request.if_modified_since,
                )),
            )),
            (Method::Delete, None) => {
                commands.push(Command::new(index, CommandKind::Delete(DeleteCommand::new(index, url))));
            }
            (Method::Post, Some(resource)) => {
                check_url_type(index, &url, resource)?;
                commands.push(Command::new(
                    index,
                    CommandKind::Create(CreateCommand::new(
                        index,
                        url,
                        entry.full_url.clone(),
                        resource.clone(),
                        request.if_none_exist.clone(),
                    )),
                ));
                self.push_reference_commands(index, resource, commands);
            }
            (Method::Put, Some(resource)) => {
                check_url_type(index, &url, resource)?;
                commands.push(Command::new(
                    index,
                    CommandKind::Update(UpdateCommand::new(
                        index,
                        url,
                        entry.full_url.clone(),
                        resource.clone(),
                        request.if_match.clone(),
                    )),
                ));
                self.push_reference_commands(index, resource, commands);
            }
            (method, resource) => {
                return Err(EngineError::bad_request(format!(
                    "entry {index}: {method} {} a resource is not supported",
                    if resource.is_some() { "with" } else { "without" }
                )));
            }
        }
        Ok(())
    }

    fn push_reference_commands(&self, index: usize, resource: &Resource, commands: &mut Vec<Command>) {
        if extract_references(resource).is_empty() {
            return;
        }
        commands.push(Command::new(
            index,
            CommandKind::ResolveReferences(ResolveReferencesCommand::new(index)),
        ));
        if self.config.check_references {
            commands.push(Command::new(
                index,
                CommandKind::CheckReferences(CheckReferencesCommand::new(index)),
            ));
        }
    }
}

fn check_url_type(index: usize, url: &RequestUrl, resource: &Resource) -> Result<(), EngineError> {
    match url.first_segment() {
        Some(resource_type) if resource_type == resource.resource_type => Ok(()),
        other => Err(EngineError::bad_request(format!(
            "entry {index}: url type {:?} does not match resource type {}",
            other.unwrap_or_default(),
            resource.resource_type
        ))),
    }
}
