//! Application-submitted sends (§3.5, §4.1, §9 "lazy payload production").

use crate::{seq::SeqNum, status::Status};

/// Budget handed to [`SendRequest::generate_bytes`] describing how much room
/// is left for the user payload in the current outgoing packet.
#[derive(Debug, Clone, Copy)]
pub struct LazySliceArgs {
    /// Bytes already reserved ahead of the payload (ack frame + codec prefix).
    pub desired_border: usize,
    /// Maximum number of bytes the payload may occupy.
    pub max_length: usize,
    /// Whether this packet already carries other content (e.g. an ack) --
    /// a request may choose to produce nothing rather than pad a packet
    /// that's already useful.
    pub has_other_content: bool,
}

/// An application-submitted unit of data to send reliably.
///
/// `generate_bytes` is invoked **at most once**; `ack` is invoked **exactly
/// once**, with [`Status::Ok`] if the peer acknowledged it, [`Status::Unavailable`]
/// if it was nacked, or [`Status::Cancelled`] if the protocol closed first.
pub trait SendRequest {
    /// Produces this request's payload bytes, given the space available.
    fn generate_bytes(&mut self, args: LazySliceArgs) -> Vec<u8>;

    /// Delivers the final outcome of this send.
    fn ack(&mut self, status: Status);
}

/// Adapts a pair of closures into a [`SendRequest`], mirroring the lazy-slice
/// design note (§9): `generate_bytes` is a move-only `FnOnce` so payload
/// production can be deferred until the sender actually has a slot for it.
pub struct FnSendRequest<GB, A>
where
    GB: FnOnce(LazySliceArgs) -> Vec<u8>,
    A: FnOnce(Status),
{
    generate_bytes: Option<GB>,
    ack: Option<A>,
}

impl<GB, A> FnSendRequest<GB, A>
where
    GB: FnOnce(LazySliceArgs) -> Vec<u8>,
    A: FnOnce(Status),
{
    pub fn new(generate_bytes: GB, ack: A) -> Self {
        Self {
            generate_bytes: Some(generate_bytes),
            ack: Some(ack),
        }
    }
}

impl<GB, A> SendRequest for FnSendRequest<GB, A>
where
    GB: FnOnce(LazySliceArgs) -> Vec<u8>,
    A: FnOnce(Status),
{
    fn generate_bytes(&mut self, args: LazySliceArgs) -> Vec<u8> {
        let generate_bytes = self
            .generate_bytes
            .take()
            .expect("generate_bytes must not be called more than once");
        generate_bytes(args)
    }

    fn ack(&mut self, status: Status) {
        if let Some(ack) = self.ack.take() {
            ack(status);
        }
    }
}

/// Owning handle to a queued or outstanding [`SendRequest`].
///
/// Guarantees the "`Ack` invoked exactly once" contract from §4.1: if this
/// handle is dropped before [`SendRequestHdl::ack`] is called explicitly
/// (e.g. the protocol discards it during a panic-free early return), the
/// request is delivered [`Status::Cancelled`] instead of being silently
/// forgotten.
pub struct SendRequestHdl {
    request: Option<Box<dyn SendRequest>>,
}

impl SendRequestHdl {
    #[must_use]
    pub fn new(request: Box<dyn SendRequest>) -> Self {
        Self {
            request: Some(request),
        }
    }

    pub(crate) fn generate_bytes(&mut self, args: LazySliceArgs) -> Vec<u8> {
        match &mut self.request {
            Some(request) => request.generate_bytes(args),
            None => Vec::new(),
        }
    }

    /// Delivers the final outcome and consumes this handle.
    pub(crate) fn ack(mut self, status: Status) {
        if let Some(mut request) = self.request.take() {
            request.ack(status);
        }
    }
}

impl Drop for SendRequestHdl {
    fn drop(&mut self) {
        if let Some(mut request) = self.request.take() {
            request.ack(Status::Cancelled);
        }
    }
}

impl core::fmt::Debug for SendRequestHdl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendRequestHdl")
            .field("consumed", &self.request.is_none())
            .finish()
    }
}

/// Lazily produces an outgoing packet's bytes once the sender is ready for them.
pub type PayloadGenerator = Box<dyn FnOnce(LazySliceArgs) -> Vec<u8>>;

/// Runs once the packet sender has handed the generated bytes off to the wire.
pub type SentCallback = Box<dyn FnOnce()>;

/// An unreliable transport capable of sending one packet at a time.
///
/// The protocol core calls [`PacketSender::send_packet`] once a BBR
/// transmission slot has been granted; the sender is expected to call
/// `generate` exactly once to obtain the bytes to put on the wire, then
/// invoke `on_sent` once that's done (so the protocol can start preparing
/// its next packet).
pub trait PacketSender {
    fn send_packet(&mut self, seq: SeqNum, generate: PayloadGenerator, on_sent: SentCallback);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_handle_delivers_cancelled() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();
        let request = FnSendRequest::new(
            |_args: LazySliceArgs| Vec::new(),
            move |status| *result_clone.borrow_mut() = Some(status),
        );
        let hdl = SendRequestHdl::new(Box::new(request));
        drop(hdl);
        assert_eq!(Some(Status::Cancelled), *result.borrow());
    }

    #[test]
    fn explicit_ack_does_not_double_fire() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let calls = Rc::new(RefCell::new(Vec::new()));
        let calls_clone = calls.clone();
        let request = FnSendRequest::new(
            |_args: LazySliceArgs| Vec::new(),
            move |status| calls_clone.borrow_mut().push(status),
        );
        let hdl = SendRequestHdl::new(Box::new(request));
        hdl.ack(Status::Ok);
        assert_eq!(vec![Status::Ok], *calls.borrow());
    }
}
