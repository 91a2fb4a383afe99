//! Socket calls. Addresses and option values are opaque bytes to the
//! engine; the service interprets them.

use log::debug;
use nix::{errno::Errno, libc};

use crate::{
    error::Result,
    services::Reply,
    tracer::memory::{CallerMemoryExt, MAX_RW_COUNT},
    types::behavior::Behavior,
};

use super::{caller_errno, fd::close_service_fd, try_caller, WrapContext};

/// Upper bound of the iovec count of one message, as `UIO_MAXIOV`.
const IOV_MAX: usize = 1024;

impl WrapContext<'_> {
    /// Writes a socket address reply to `addr`, truncated to the capacity
    /// found at `len_ptr`, and stores the full address length there.
    fn write_sockaddr(
        &mut self,
        addr: usize,
        len_ptr: usize,
        bytes: &[u8],
    ) -> Result<std::result::Result<(), Errno>> {
        if addr == 0 {
            return Ok(Ok(()));
        }

        let written = (|| {
            let capacity: u32 = self.memory().read_value(len_ptr)?;
            self.copy_out(addr, capacity as _, bytes)?;
            self.memory().write_value(len_ptr, &(bytes.len() as u32))
        })();

        match written {
            Ok(()) => Ok(Ok(())),
            Err(e) => Ok(Err(caller_errno(e)?)),
        }
    }

    fn read_iovecs(&mut self, iov: usize, count: usize) -> Result<Vec<libc::iovec>> {
        if count > IOV_MAX {
            return Err(Errno::EMSGSIZE.into());
        }

        (0..count)
            .map(|i| {
                self.memory()
                    .read_value::<libc::iovec>(iov + i * std::mem::size_of::<libc::iovec>())
            })
            .collect()
    }

    /// Copies `data` across `iovecs`. Returns the number of bytes written.
    fn scatter(&mut self, iovecs: &[libc::iovec], data: &[u8]) -> Result<usize> {
        let mut done = 0;
        for iov in iovecs {
            if done == data.len() {
                break;
            }
            done += self.copy_out(iov.iov_base as _, iov.iov_len, &data[done..])?;
        }
        Ok(done)
    }
}

/// `socket(domain, type, protocol)`. The service socket is backed by a
/// placeholder descriptor like an opened file.
pub fn socket_in(ctx: &mut WrapContext) -> Result<Behavior> {
    if ctx.service().is_none() {
        return Ok(Behavior::Std);
    }

    let ty = ctx.arg(1) as i32;
    let (result, _) = ctx.call(|_| ());

    match result {
        Ok(sfd) => ctx.install_placeholder(
            sfd,
            Default::default(),
            ty & libc::SOCK_CLOEXEC != 0,
            ty & libc::SOCK_NONBLOCK != 0,
        ),
        Err(e) => ctx.fake(Err(e)),
    }
}

/// `bind(fd, addr, len)` and `connect(fd, addr, len)`.
pub fn sockaddr_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (addr, len) = (ctx.arg(1), ctx.arg(2));
    let sockaddr = try_caller!(ctx, ctx.memory().read_bytes(addr, len));

    let (result, _) = ctx.call(|call| call.sockaddr = sockaddr);
    ctx.fake(result)
}

/// Calls without buffers: `listen`, `shutdown`.
pub fn plain_in(ctx: &mut WrapContext) -> Result<Behavior> {
    super::std_in(ctx)
}

/// `accept(fd, addr, len)` and `accept4(fd, addr, len, flags)`.
pub fn accept_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let Some(listening) = ctx.virtual_file() else {
        return Ok(Behavior::Std);
    };

    let (addr, len_ptr) = (ctx.arg(1), ctx.arg(2));
    let flags = match ctx.entry.sysno {
        syscalls::Sysno::accept4 => ctx.arg(3) as i32,
        _ => 0,
    };

    let (result, reply) = ctx.call(|_| ());
    let sfd = match result {
        Ok(sfd) => sfd,
        Err(e) => return ctx.fake(Err(e)),
    };

    if let Reply::Bytes(peer) = reply {
        if let Err(e) = ctx.write_sockaddr(addr, len_ptr, &peer)? {
            debug!("{} accept: lost connection sfd {sfd}", ctx.pcb);
            let at = ctx.pcb.lookup_timestamp();
            let file = crate::pcb::fd_table::VirtualFile {
                service: listening.service,
                sfd,
                path: listening.path.clone(),
            };
            close_service_fd(ctx.registry, ctx.epochs, at, ctx.id, ctx.pcb.pid, &file);
            return ctx.fake(Err(e));
        }
    }

    ctx.install_placeholder(
        sfd,
        listening.path.clone(),
        flags & libc::SOCK_CLOEXEC != 0,
        flags & libc::SOCK_NONBLOCK != 0,
    )
}

/// `getsockname(fd, addr, len)` and `getpeername(fd, addr, len)`.
pub fn sockaddr_out_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (addr, len_ptr) = (ctx.arg(1), ctx.arg(2));
    let (result, reply) = ctx.call(|_| ());

    if let (Ok(_), Reply::Bytes(bytes)) = (&result, reply) {
        if let Err(e) = ctx.write_sockaddr(addr, len_ptr, &bytes)? {
            return ctx.fake(Err(e));
        }
    }

    ctx.fake(result.map(|_| 0))
}

/// `setsockopt(fd, level, name, value, len)`.
pub fn setsockopt_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (value, len) = (ctx.arg(3), ctx.arg(4));
    let input = try_caller!(ctx, ctx.memory().read_bytes(value, len));

    let (result, _) = ctx.call(|call| call.input = input);
    ctx.fake(result)
}

/// `getsockopt(fd, level, name, value, len)`.
pub fn getsockopt_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (value, len_ptr) = (ctx.arg(3), ctx.arg(4));
    let capacity: u32 = try_caller!(ctx, ctx.memory().read_value(len_ptr));

    let (result, reply) = ctx.call(|call| call.args.arg4 = capacity as _);

    if let (Ok(_), Reply::Bytes(bytes)) = (&result, reply) {
        let n = try_caller!(ctx, ctx.copy_out(value, capacity as _, &bytes));
        try_caller!(ctx, ctx.memory().write_value(len_ptr, &(n as u32)));
    }

    ctx.fake(result.map(|_| 0))
}

/// `sendto(fd, buf, len, flags, addr, addrlen)`.
pub fn sendto_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (buf, len, addr, addrlen) = (ctx.arg(1), ctx.arg(2), ctx.arg(4), ctx.arg(5));

    let input = try_caller!(ctx, ctx.memory().read_bytes(buf, len.min(MAX_RW_COUNT)));
    let sockaddr = match addr {
        0 => Vec::new(),
        _ => try_caller!(ctx, ctx.memory().read_bytes(addr, addrlen)),
    };

    let (result, _) = ctx.call(|call| {
        call.input = input;
        call.sockaddr = sockaddr;
    });
    ctx.fake(result)
}

/// `recvfrom(fd, buf, len, flags, addr, addrlen)`.
pub fn recvfrom_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (buf, len, addr, len_ptr) = (ctx.arg(1), ctx.arg(2), ctx.arg(4), ctx.arg(5));
    let (result, reply) = ctx.call(|_| ());

    let (data, from) = match (result, reply) {
        (Err(e), _) => return ctx.fake(Err(e)),
        (Ok(_), Reply::Bytes(data)) => (data, None),
        (Ok(_), Reply::Datagram { data, addr }) => (data, Some(addr)),
        (Ok(n), _) => return ctx.fake(Ok(n)),
    };

    let n = try_caller!(ctx, ctx.copy_out(buf, len, &data));
    if let Some(from) = from {
        if let Err(e) = ctx.write_sockaddr(addr, len_ptr, &from)? {
            return ctx.fake(Err(e));
        }
    }

    ctx.fake(Ok(n as _))
}

/// `sendmsg(fd, msg, flags)`. The payload is gathered from the iovecs;
/// ancillary data is not passed on.
pub fn sendmsg_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let msg_ptr = ctx.arg(1);
    let msg: libc::msghdr = try_caller!(ctx, ctx.memory().read_value(msg_ptr));
    let iovecs = try_caller!(ctx, ctx.read_iovecs(msg.msg_iov as _, msg.msg_iovlen as _));

    let mut input = Vec::new();
    for iov in &iovecs {
        let len = iov.iov_len.min(MAX_RW_COUNT - input.len());
        let bytes = try_caller!(ctx, ctx.memory().read_bytes(iov.iov_base as _, len));
        input.extend_from_slice(&bytes);
    }

    let sockaddr = match msg.msg_name as usize {
        0 => Vec::new(),
        name => try_caller!(ctx, ctx.memory().read_bytes(name, msg.msg_namelen as _)),
    };

    let (result, _) = ctx.call(|call| {
        call.args.arg2 = input.len();
        call.input = input;
        call.sockaddr = sockaddr;
    });
    ctx.fake(result)
}

/// `recvmsg(fd, msg, flags)`. The payload is scattered over the iovecs;
/// no ancillary data is ever returned.
pub fn recvmsg_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let msg_ptr = ctx.arg(1);
    let mut msg: libc::msghdr = try_caller!(ctx, ctx.memory().read_value(msg_ptr));
    let iovecs = try_caller!(ctx, ctx.read_iovecs(msg.msg_iov as _, msg.msg_iovlen as _));
    let capacity: usize = iovecs.iter().map(|iov| iov.iov_len).sum();

    let (result, reply) = ctx.call(|call| call.args.arg2 = capacity);

    let (data, from) = match (result, reply) {
        (Err(e), _) => return ctx.fake(Err(e)),
        (Ok(_), Reply::Bytes(data)) => (data, Vec::new()),
        (Ok(_), Reply::Datagram { data, addr }) => (data, addr),
        (Ok(n), _) => return ctx.fake(Ok(n)),
    };

    let n = try_caller!(ctx, ctx.scatter(&iovecs, &data));

    if !msg.msg_name.is_null() {
        let written = from.len().min(msg.msg_namelen as _);
        try_caller!(
            ctx,
            ctx.copy_out(msg.msg_name as _, written, &from[..written])
        );
        msg.msg_namelen = from.len() as _;
    }
    msg.msg_controllen = 0;
    msg.msg_flags = if n < data.len() { libc::MSG_TRUNC } else { 0 };

    try_caller!(ctx, ctx.memory().write_value(msg_ptr, &msg));
    ctx.fake(Ok(n as _))
}
