//! Blog service backed by an in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tandem::{CallContext, Client, ResponseSink, Router, RouterError, Status, Streaming};

pub const CREATE_BLOG: &str = "blog.CreateBlog";
pub const READ_BLOG: &str = "blog.ReadBlog";
pub const UPDATE_BLOG: &str = "blog.UpdateBlog";
pub const DELETE_BLOG: &str = "blog.DeleteBlog";
pub const LIST_BLOG: &str = "blog.ListBlog";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blog {
    /// Assigned by the store on create; ignored in create requests.
    pub id: u64,
    pub author_id: String,
    pub title: String,
    pub content: String,
}

impl Blog {
    pub fn new(
        author_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            author_id: author_id.into(),
            title: title.into(),
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogId {
    pub blog_id: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBlogRequest {}

#[derive(Debug, Default)]
struct Store {
    next_id: u64,
    posts: BTreeMap<u64, Blog>,
}

#[derive(Debug, Default)]
pub struct BlogService {
    store: Mutex<Store>,
}

fn not_found(id: u64) -> Status {
    Status::not_found(format!("cannot find blog with id {}", id))
}

impl BlogService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, mut blog: Blog) -> Blog {
        let mut store = self.store.lock();
        store.next_id += 1;
        blog.id = store.next_id;
        store.posts.insert(blog.id, blog.clone());
        tracing::debug!(id = blog.id, author = %blog.author_id, "blog created");
        blog
    }

    pub fn read(&self, id: u64) -> Result<Blog, Status> {
        self.store
            .lock()
            .posts
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    pub fn update(&self, blog: Blog) -> Result<Blog, Status> {
        let mut store = self.store.lock();
        let Some(existing) = store.posts.get_mut(&blog.id) else {
            return Err(not_found(blog.id));
        };
        *existing = blog.clone();
        tracing::debug!(id = blog.id, "blog updated");
        Ok(blog)
    }

    pub fn delete(&self, id: u64) -> Result<BlogId, Status> {
        match self.store.lock().posts.remove(&id) {
            Some(_) => {
                tracing::debug!(id, "blog deleted");
                Ok(BlogId { blog_id: id })
            }
            None => Err(not_found(id)),
        }
    }

    /// Every post, ordered by id.
    pub fn snapshot(&self) -> Vec<Blog> {
        self.store.lock().posts.values().cloned().collect()
    }

    pub async fn list(&self, sink: ResponseSink<Blog>) -> Result<(), Status> {
        // Snapshot first so the lock is never held across a send.
        for blog in self.snapshot() {
            sink.send(blog).await?;
        }
        Ok(())
    }
}

pub fn register(router: &mut Router, service: Arc<BlogService>) -> Result<(), RouterError> {
    let svc = service.clone();
    router.unary(CREATE_BLOG, move |_ctx, blog: Blog| {
        let svc = svc.clone();
        async move { Ok(svc.create(blog)) }
    })?;

    let svc = service.clone();
    router.unary(READ_BLOG, move |_ctx, request: BlogId| {
        let svc = svc.clone();
        async move { svc.read(request.blog_id) }
    })?;

    let svc = service.clone();
    router.unary(UPDATE_BLOG, move |_ctx, blog: Blog| {
        let svc = svc.clone();
        async move { svc.update(blog) }
    })?;

    let svc = service.clone();
    router.unary(DELETE_BLOG, move |_ctx, request: BlogId| {
        let svc = svc.clone();
        async move { svc.delete(request.blog_id) }
    })?;

    let svc = service;
    router.server_streaming(LIST_BLOG, move |_ctx, _request: ListBlogRequest, sink| {
        let svc = svc.clone();
        async move { svc.list(sink).await }
    })?;

    Ok(())
}

#[derive(Clone, Debug)]
pub struct BlogClient {
    client: Client,
}

impl BlogClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn create(&self, ctx: &CallContext, blog: Blog) -> Result<Blog, Status> {
        self.client.unary(CREATE_BLOG, ctx, blog).await
    }

    pub async fn read(&self, ctx: &CallContext, blog_id: u64) -> Result<Blog, Status> {
        self.client.unary(READ_BLOG, ctx, BlogId { blog_id }).await
    }

    pub async fn update(&self, ctx: &CallContext, blog: Blog) -> Result<Blog, Status> {
        self.client.unary(UPDATE_BLOG, ctx, blog).await
    }

    pub async fn delete(&self, ctx: &CallContext, blog_id: u64) -> Result<u64, Status> {
        let deleted: BlogId = self.client.unary(DELETE_BLOG, ctx, BlogId { blog_id }).await?;
        Ok(deleted.blog_id)
    }

    pub async fn list(&self, ctx: &CallContext) -> Result<Streaming<Blog>, Status> {
        self.client
            .server_streaming(LIST_BLOG, ctx, ListBlogRequest {})
            .await
    }
}
