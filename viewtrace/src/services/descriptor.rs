use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;
use derive_builder::Builder;
use syscalls::Sysno;

use crate::{error::SysResult, types::service_code::ServiceCode};

use super::{
    decline_all, ChoiceContext, ChoiceFn, ChoiceQuery, Claim, CtlClasses, CtlEvent, CtlFn,
    EventSource, IoctlShape, IoctlShapeFn, ServiceCall, SocketCall, SysHandler,
};

/// Everything a service module hands over at registration. Handler maps are
/// sparse; the registry turns them into dense tables.
#[derive(Builder, Derivative)]
#[derivative(Debug)]
#[builder(pattern = "owned")]
pub struct ServiceDescriptor {
    #[builder(setter(into))]
    pub name: String,

    /// Requested code. The lowest free one is assigned if unset.
    #[builder(default, setter(strip_option))]
    pub code: Option<ServiceCode>,

    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub syscalls: HashMap<Sysno, SysHandler>,

    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub socketcalls: HashMap<SocketCall, SysHandler>,

    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub virtual_calls: HashMap<usize, SysHandler>,

    #[builder(default = "decline_all()")]
    #[derivative(Debug = "ignore")]
    pub choice: ChoiceFn,

    #[builder(default, setter(strip_option))]
    #[derivative(Debug = "ignore")]
    pub event_source: Option<Arc<dyn EventSource>>,

    #[builder(default)]
    pub ctl_classes: CtlClasses,

    #[builder(default, setter(strip_option))]
    #[derivative(Debug = "ignore")]
    pub ctl: Option<CtlFn>,

    #[builder(default, setter(strip_option))]
    #[derivative(Debug = "ignore")]
    pub ioctl_shape: Option<IoctlShapeFn>,
}

impl ServiceDescriptor {
    pub fn builder(name: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder::default().name(name)
    }
}

impl ServiceDescriptorBuilder {
    /// Handles `sysno`. Variants of one call (`open`/`openat`/`creat`, the
    /// stat family, ...) are all routed to the handler of the canonical one.
    pub fn syscall(
        mut self,
        sysno: Sysno,
        f: impl Fn(&mut ServiceCall) -> SysResult + Send + Sync + 'static,
    ) -> Self {
        self.syscalls
            .get_or_insert_with(HashMap::new)
            .insert(sysno, Arc::new(f));
        self
    }

    pub fn socketcall(
        mut self,
        call: SocketCall,
        f: impl Fn(&mut ServiceCall) -> SysResult + Send + Sync + 'static,
    ) -> Self {
        self.socketcalls
            .get_or_insert_with(HashMap::new)
            .insert(call, Arc::new(f));
        self
    }

    pub fn virtual_call(
        mut self,
        nr: usize,
        f: impl Fn(&mut ServiceCall) -> SysResult + Send + Sync + 'static,
    ) -> Self {
        self.virtual_calls
            .get_or_insert_with(HashMap::new)
            .insert(nr, Arc::new(f));
        self
    }

    pub fn choose(
        self,
        f: impl Fn(&ChoiceQuery, &ChoiceContext) -> Claim + Send + Sync + 'static,
    ) -> Self {
        self.choice(Arc::new(f))
    }

    pub fn on_ctl(
        self,
        classes: CtlClasses,
        f: impl Fn(&CtlEvent) + Send + Sync + 'static,
    ) -> Self {
        self.ctl_classes(classes).ctl(Arc::new(f))
    }

    pub fn ioctl_shapes(
        self,
        f: impl Fn(u64) -> Option<IoctlShape> + Send + Sync + 'static,
    ) -> Self {
        self.ioctl_shape(Arc::new(f))
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;

    #[test]
    fn test_builder_collects_handlers() {
        let desc = ServiceDescriptor::builder("null")
            .code(ServiceCode(7))
            .syscall(Sysno::open, |_| Ok(3))
            .syscall(Sysno::close, |_| Ok(0))
            .socketcall(SocketCall::Socket, |_| Err(Errno::EAFNOSUPPORT))
            .build()
            .unwrap();

        assert_eq!(desc.name, "null");
        assert_eq!(desc.code, Some(ServiceCode(7)));
        assert_eq!(desc.syscalls.len(), 2);
        assert_eq!(desc.socketcalls.len(), 1);
        assert!(desc.virtual_calls.is_empty());
        assert!(desc.ctl.is_none());
    }

    #[test]
    fn test_builder_requires_name() {
        assert!(ServiceDescriptorBuilder::default().build().is_err());
    }
}
