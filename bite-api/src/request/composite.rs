use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};

use super::{ErrorHook, Record, Request, RequestNode, ResultStream};
use crate::Service;
use crate::error::{Error, Result};
use crate::http::HttpRequest;
use crate::models::with_description;

/// Combines the result streams of a composite's children.
///
/// Children are already running when this is called; composers must pull
/// from them lazily.
pub type Composer = Arc<dyn Fn(Service, Vec<ResultStream>) -> ResultStream + Send + Sync>;

pub struct CompositeRequest {
    options: Vec<String>,
    children: Vec<Request>,
    compose: Composer,
    on_error: Option<ErrorHook>,
    many: bool,
}

impl CompositeRequest {
    pub fn new<F>(children: Vec<Request>, compose: F) -> Self
    where
        F: Fn(Service, Vec<ResultStream>) -> ResultStream + Send + Sync + 'static,
    {
        Self {
            options: Vec::new(),
            children,
            compose: Arc::new(compose),
            on_error: None,
            many: false,
        }
    }

    /// Children's results concatenated in construction order.
    pub fn group(children: Vec<Request>) -> Self {
        Self::new(children, concat).many()
    }

    /// Everything a single child yields gathered into one `Record::List`.
    pub fn collect(child: Request) -> Self {
        Self::new(vec![child], gather)
    }

    /// Items from the first child with comments, attachments and changes
    /// from the remaining children attached, one chunk per item.
    ///
    /// With `describe` set the item description is prepended as comment #0.
    pub fn assemble(children: Vec<Request>, describe: bool) -> Self {
        Self::new(children, move |_, streams| assemble(streams, describe)).many()
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn on_error(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }

    pub fn single(mut self) -> Self {
        self.many = false;
        self
    }

    pub fn yields_many(&self) -> bool {
        self.many
    }

    pub fn children(&self) -> &[Request] {
        &self.children
    }

    pub(crate) fn take_children(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.children)
    }
}

impl RequestNode for CompositeRequest {
    type Input = (Service, Vec<ResultStream>);
    type Output = ResultStream;

    fn options(&self) -> Vec<String> {
        let mut options = self.options.clone();
        for child in &self.children {
            for option in child.options() {
                if !options.contains(&option) {
                    options.push(option);
                }
            }
        }
        options
    }

    fn finalize(&mut self, service: &Service) -> Result<()> {
        for child in &mut self.children {
            child.finalize(service)?;
        }
        Ok(())
    }

    fn prepare(&mut self, service: &Service) -> Result<Vec<HttpRequest>> {
        let mut prepared = Vec::new();
        for child in &mut self.children {
            prepared.extend(child.prepare(service)?);
        }
        Ok(prepared)
    }

    fn parse(&self, (service, streams): (Service, Vec<ResultStream>)) -> Result<ResultStream> {
        Ok((self.compose)(service, streams))
    }

    fn handle_exception(&self, err: Error) -> Error {
        match &self.on_error {
            Some(hook) => hook(err),
            None => err,
        }
    }
}

/// Placeholder for an optional part nobody asked for.
///
/// Yields nothing. Inside [`CompositeRequest::assemble`] an exhausted part
/// reads as `Record::Null` for every item, so it still lines up with real
/// children; sent on its own it resolves to a single `Record::Null`.
#[derive(Debug, Default, Clone)]
pub struct NullRequest;

impl NullRequest {
    pub fn new() -> Self {
        Self
    }
}

impl RequestNode for NullRequest {
    type Input = ();
    type Output = ResultStream;

    fn options(&self) -> Vec<String> {
        Vec::new()
    }

    fn finalize(&mut self, _service: &Service) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self, _service: &Service) -> Result<Vec<HttpRequest>> {
        Ok(Vec::new())
    }

    fn parse(&self, _input: ()) -> Result<ResultStream> {
        Ok(stream::empty().boxed())
    }
}

fn concat(_service: Service, streams: Vec<ResultStream>) -> ResultStream {
    stream::iter(streams).flatten().boxed()
}

fn gather(_service: Service, streams: Vec<ResultStream>) -> ResultStream {
    stream::once(async move {
        stream::iter(streams)
            .flatten()
            .try_collect::<Vec<Record>>()
            .await
            .map(Record::List)
    })
    .boxed()
}

struct Assembly {
    items: ResultStream,
    parts: Vec<ResultStream>,
    done: bool,
}

fn assemble(streams: Vec<ResultStream>, describe: bool) -> ResultStream {
    let mut streams = streams.into_iter();
    let Some(items) = streams.next() else {
        return stream::empty().boxed();
    };
    let state = Assembly {
        items,
        parts: streams.collect(),
        done: false,
    };

    // the first error ends assembly; items already yielded stay valid
    stream::unfold(state, move |mut state| async move {
        if state.done {
            return None;
        }
        let result = match state.items.next().await? {
            Ok(record) => attach(record, &mut state.parts, describe).await,
            Err(err) => Err(err),
        };
        state.done = result.is_err();
        Some((result, state))
    })
    .boxed()
}

async fn attach(record: Record, parts: &mut [ResultStream], describe: bool) -> Result<Record> {
    let Record::Item(mut item) = record else {
        return Ok(record);
    };

    for part in parts.iter_mut() {
        let chunk = match part.next().await {
            Some(chunk) => chunk?,
            None => Record::Null,
        };
        for record in chunk.into_list() {
            match record {
                Record::Comment(comment) => item.comments.push(comment),
                Record::Attachment(attachment) => item.attachments.push(attachment),
                Record::Change(change) => item.changes.push(change),
                _ => {}
            }
        }
    }

    if describe {
        let comments = std::mem::take(&mut item.comments);
        item.comments = with_description(item.description_comment(), comments);
    }
    Ok(Record::Item(item))
}
