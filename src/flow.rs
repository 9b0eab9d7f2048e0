#![forbid(unsafe_code)]
//! [`Flow`]: a named, validated, dependency-aware handler description.
//!
//! Creating a `Flow` does not reserve any resources — it's a plain value,
//! the same way [`Executor`](crate::executor::Executor) is a plain value
//! until a [`Scope`](crate::scope::Scope) resolves it. A flow is invoked
//! through [`crate::exec_context::ExecutionContext::exec`] or
//! [`crate::flow_executor::execute`].

use crate::{
    error::CoreError,
    eventual::Eventual,
    exec_context::ExecutionContext,
    executor::DependencySpec,
    tag::{Tag, TagMap, TagReader, Tagged},
};
use std::rc::Rc;

type Validator<T> = Rc<dyn Fn(&T) -> Result<(), Vec<String>>>;
type Handler<In, Out> = Rc<dyn Fn(ExecutionContext, In) -> Eventual<Result<Out, CoreError>>>;

pub struct FlowInner<In, Out> {
    name: Option<&'static str>,
    version: Option<&'static str>,
    input_validator: Option<Validator<In>>,
    output_validator: Option<Validator<Out>>,
    tags: TagMap,
    dependencies: DependencySpec,
    handler: Handler<In, Out>,
}

/// A handler description: input/output validators, attached definition
/// tags, a declared dependency shape, and the closure that does the work.
pub struct Flow<In, Out> {
    pub(crate) inner: Rc<FlowInner<In, Out>>,
}

impl<In, Out> Clone for Flow<In, Out> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<In: 'static, Out: 'static> Flow<In, Out> {
    pub fn new(
        name: Option<&'static str>,
        handler: impl Fn(ExecutionContext, In) -> Eventual<Result<Out, CoreError>> + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(FlowInner {
                name,
                version: None,
                input_validator: None,
                output_validator: None,
                tags: TagMap::new(),
                dependencies: DependencySpec::None,
                handler: Rc::new(handler),
            }),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.inner.name
    }

    pub fn version(&self) -> Option<&'static str> {
        self.inner.version
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        Rc::get_mut(&mut self.inner).expect("with_version before sharing").version = Some(version);
        self
    }

    pub fn with_input_validator(
        mut self,
        validator: impl Fn(&In) -> Result<(), Vec<String>> + 'static,
    ) -> Self {
        Rc::get_mut(&mut self.inner).expect("with_input_validator before sharing").input_validator =
            Some(Rc::new(validator));
        self
    }

    pub fn with_output_validator(
        mut self,
        validator: impl Fn(&Out) -> Result<(), Vec<String>> + 'static,
    ) -> Self {
        Rc::get_mut(&mut self.inner).expect("with_output_validator before sharing").output_validator =
            Some(Rc::new(validator));
        self
    }

    pub fn with_tag<U: 'static>(mut self, tagged: Tagged<U>) -> Self {
        Rc::get_mut(&mut self.inner).expect("with_tag before sharing").tags.insert(tagged);
        self
    }

    pub fn with_dependencies(mut self, dependencies: DependencySpec) -> Self {
        Rc::get_mut(&mut self.inner).expect("with_dependencies before sharing").dependencies = dependencies;
        self
    }

    pub fn definition_tags(&self) -> &TagMap {
        &self.inner.tags
    }

    pub fn dependencies(&self) -> &DependencySpec {
        &self.inner.dependencies
    }

    pub(crate) fn validate_input(&self, input: &In) -> Result<(), CoreError> {
        match &self.inner.input_validator {
            Some(v) => v(input).map_err(|issues| CoreError::SchemaValidation {
                subject: self.inner.name.unwrap_or("<anonymous flow input>").to_string(),
                issues,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn validate_output(&self, output: &Out) -> Result<(), CoreError> {
        match &self.inner.output_validator {
            Some(v) => v(output).map_err(|issues| CoreError::SchemaValidation {
                subject: self.inner.name.unwrap_or("<anonymous flow output>").to_string(),
                issues,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn invoke(&self, ctx: ExecutionContext, input: In) -> Eventual<Result<Out, CoreError>> {
        (self.inner.handler)(ctx, input)
    }
}

impl<In, Out> TagReader for Flow<In, Out> {
    fn read<U: Clone + 'static>(&self, tag: &Tag<U>) -> Option<U> {
        self.inner.tags.read(tag)
    }

    fn collect<U: Clone + 'static>(&self, tag: &Tag<U>) -> Vec<U> {
        self.inner.tags.collect(tag)
    }
}
