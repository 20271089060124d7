//! Scripted chat backend for deterministic tests without API calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use foreman_core::chat::{EndMessageHook, MessageObserver, ToolCallObserver};
use foreman_core::ids::ChatId;
use foreman_core::{BackendError, ChatBackend, ChatMessage, TokenUsage, Tool};

/// Pre-programmed replies, consumed in order.
pub enum MockReply {
    Text(String),
    /// Text plus token counters, for spend-gate and audit tests.
    Usage(String, TokenUsage),
    Error(String),
    /// Wait, then yield the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

#[derive(Default)]
struct Observers {
    new_message: Vec<MessageObserver>,
    end_message: Vec<EndMessageHook>,
    tool_call: Vec<ToolCallObserver>,
    tool_result: Vec<ToolCallObserver>,
}

/// A reply queue and call counter shared between every backend created from
/// it. Sessions create one backend per chat; scripting a whole pipeline run
/// means scripting the sequence across chats.
#[derive(Clone, Default)]
pub struct SharedScript {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    calls: Arc<AtomicUsize>,
}

impl SharedScript {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_replies(replies: Vec<String>) -> Self {
        Self::new(replies.into_iter().map(MockReply::Text).collect())
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Total asks across every backend sharing this script.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    /// A fresh conversation drawing from this script.
    pub fn backend(&self) -> MockBackend {
        MockBackend {
            id: ChatId::new(),
            replies: Arc::clone(&self.replies),
            messages: Mutex::new(Vec::new()),
            tools: Mutex::new(Vec::new()),
            observers: Mutex::new(Observers::default()),
            calls: Arc::clone(&self.calls),
        }
    }
}

/// Mock backend returning scripted replies in sequence. Exhausting the script
/// fails the call, which keeps tests honest about how many exchanges ran.
pub struct MockBackend {
    id: ChatId,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    messages: Mutex<Vec<ChatMessage>>,
    tools: Mutex<Vec<Arc<dyn Tool>>>,
    observers: Mutex<Observers>,
    calls: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        SharedScript::new(replies).backend()
    }

    pub fn with_replies(replies: Vec<String>) -> Self {
        Self::new(replies.into_iter().map(MockReply::Text).collect())
    }

    /// Append a reply to the script after construction.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.lock().clone()
    }

    fn notify_new(&self, message: &ChatMessage) {
        for observer in &self.observers.lock().new_message {
            observer(message);
        }
    }

    async fn notify_end(&self, message: &ChatMessage) -> Result<(), BackendError> {
        let hooks: Vec<EndMessageHook> = self.observers.lock().end_message.clone();
        for hook in hooks {
            hook(message.clone()).await?;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl ChatBackend for MockBackend {
    fn id(&self) -> ChatId {
        self.id.clone()
    }

    async fn ask(&self, prompt: &str) -> Result<ChatMessage, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);

        let user = ChatMessage::user(prompt);
        self.messages.lock().push(user.clone());
        self.notify_new(&user);

        let mut reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| BackendError::Transport(format!("no reply configured for call {call}")))?;

        let (content, usage) = loop {
            match reply {
                MockReply::Text(content) => break (content, TokenUsage::default()),
                MockReply::Usage(content, usage) => break (content, usage),
                MockReply::Error(message) => return Err(BackendError::Transport(message)),
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        };

        let mut assistant = ChatMessage::assistant(content);
        assistant.usage = usage;
        self.messages.lock().push(assistant.clone());
        self.notify_new(&assistant);
        self.notify_end(&assistant).await?;

        Ok(assistant)
    }

    fn with_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        *self.tools.lock() = tools;
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    fn on_new_message(&self, observer: MessageObserver) {
        self.observers.lock().new_message.push(observer);
    }

    fn on_end_message(&self, hook: EndMessageHook) {
        self.observers.lock().end_message.push(hook);
    }

    fn on_tool_call(&self, observer: ToolCallObserver) {
        self.observers.lock().tool_call.push(observer);
    }

    fn on_tool_result(&self, observer: ToolCallObserver) {
        self.observers.lock().tool_result.push(observer);
    }
}
