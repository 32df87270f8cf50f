//! Capability registry: the surface through which the embedder supplies
//! tools, resources, prompts, and roots. The core only ever sees names (or
//! URIs) and the handler callables; argument validation stays in here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::McpResult;

pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, McpResult<Value>> + Send + Sync>;
pub type ResourceHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, McpResult<String>> + Send + Sync>;

#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: ToolHandler,
}

impl ToolDef {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = McpResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[derive(Clone)]
pub struct ResourceDef {
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: String,
    pub handler: ResourceHandler,
}

impl ResourceDef {
    pub fn new<F, Fut>(
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        mime_type: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = McpResult<String>> + Send + 'static,
    {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: description.into(),
            mime_type: mime_type.into(),
            handler: Arc::new(move |uri| Box::pin(handler(uri))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptDef {
    pub name: String,
    pub description: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct RootDef {
    pub uri: String,
    pub name: String,
}

/// Lookup/list per capability kind, plus the registered-since-last-list
/// flags the initialize response advertises for prompts and roots.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolDef>;
    async fn lookup_tool(&self, name: &str) -> Option<ToolDef>;

    async fn list_resources(&self) -> Vec<ResourceDef>;
    async fn lookup_resource(&self, uri: &str) -> Option<ResourceDef>;

    async fn list_prompts(&self) -> Vec<PromptDef>;
    async fn lookup_prompt(&self, name: &str) -> Option<PromptDef>;

    async fn list_roots(&self) -> Vec<RootDef>;

    /// A prompt was registered since the last acknowledged `prompts/list`.
    fn prompts_dirty(&self) -> bool;
    /// A root was registered since the last acknowledged `roots/list`.
    fn roots_dirty(&self) -> bool;
    /// Invoked by the `prompts/list` operation after listing.
    fn clear_prompts_dirty(&self);
    /// Invoked by the `roots/list` operation after listing.
    fn clear_roots_dirty(&self);
}

#[derive(Default)]
struct RegistryState {
    tools: Vec<ToolDef>,
    tool_by_name: HashMap<String, ToolDef>,
    resources: Vec<ResourceDef>,
    resource_by_uri: HashMap<String, ResourceDef>,
    prompts: Vec<PromptDef>,
    prompt_by_name: HashMap<String, PromptDef>,
    roots: Vec<RootDef>,
}

/// Programmatic registry: registration order is the listing order, and
/// duplicate names are rejected.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
    prompts_dirty: AtomicBool,
    roots_dirty: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_tool(&self, tool: ToolDef) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.tool_by_name.contains_key(&tool.name) {
            anyhow::bail!("duplicate tool name: {}", tool.name);
        }
        info!(tool = %tool.name, "tool registered");
        state.tool_by_name.insert(tool.name.clone(), tool.clone());
        state.tools.push(tool);
        Ok(())
    }

    pub async fn register_resource(&self, resource: ResourceDef) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.resource_by_uri.contains_key(&resource.uri) {
            anyhow::bail!("duplicate resource uri: {}", resource.uri);
        }
        info!(uri = %resource.uri, "resource registered");
        state
            .resource_by_uri
            .insert(resource.uri.clone(), resource.clone());
        state.resources.push(resource);
        Ok(())
    }

    pub async fn register_prompt(&self, prompt: PromptDef) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.prompt_by_name.contains_key(&prompt.name) {
            anyhow::bail!("duplicate prompt name: {}", prompt.name);
        }
        info!(prompt = %prompt.name, "prompt registered");
        state
            .prompt_by_name
            .insert(prompt.name.clone(), prompt.clone());
        state.prompts.push(prompt);
        self.prompts_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn register_root(&self, root: RootDef) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.roots.iter().any(|r| r.uri == root.uri) {
            anyhow::bail!("duplicate root uri: {}", root.uri);
        }
        info!(uri = %root.uri, "root registered");
        state.roots.push(root);
        self.roots_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_tools(&self) -> Vec<ToolDef> {
        self.state.read().await.tools.clone()
    }

    async fn lookup_tool(&self, name: &str) -> Option<ToolDef> {
        self.state.read().await.tool_by_name.get(name).cloned()
    }

    async fn list_resources(&self) -> Vec<ResourceDef> {
        self.state.read().await.resources.clone()
    }

    async fn lookup_resource(&self, uri: &str) -> Option<ResourceDef> {
        self.state.read().await.resource_by_uri.get(uri).cloned()
    }

    async fn list_prompts(&self) -> Vec<PromptDef> {
        self.state.read().await.prompts.clone()
    }

    async fn lookup_prompt(&self, name: &str) -> Option<PromptDef> {
        self.state.read().await.prompt_by_name.get(name).cloned()
    }

    async fn list_roots(&self) -> Vec<RootDef> {
        self.state.read().await.roots.clone()
    }

    fn prompts_dirty(&self) -> bool {
        self.prompts_dirty.load(Ordering::SeqCst)
    }

    fn roots_dirty(&self) -> bool {
        self.roots_dirty.load(Ordering::SeqCst)
    }

    fn clear_prompts_dirty(&self) {
        self.prompts_dirty.store(false, Ordering::SeqCst);
    }

    fn clear_roots_dirty(&self) {
        self.roots_dirty.store(false, Ordering::SeqCst);
    }
}
