//! Message transfer
//!
//! Copies a message from the sender's UTCB into the receiver's: untyped
//! words first, then the typed items, each matched against the next
//! receive buffer of its type. An item either names an object the
//! receiver can identify locally (a flexpage or an object id is written
//! into the message) or is mapped into the receive window.
//!
//! The FPU state travels when the sender asks for it, the receiver
//! accepts it and the sender holds write rights on the receiver.

use kestrel_abi::fpage::rcv_type;
use kestrel_abi::{BufItem, CapRights, Fpage, FpageType, L4Error, Mword, MsgTag, Phase, SndItem, Utcb, MAX_WORDS};
use spin::MutexGuard;

use crate::context::Context;
use crate::space::Space;

/// Cursor over the receive buffers of one resource type.
struct BufIter {
    idx: usize,
}

impl BufIter {
    fn new(start: usize) -> Self {
        Self { idx: start }
    }

    /// Current buffer and its receive window.
    fn get(&self, utcb: &Utcb) -> Option<(BufItem, Fpage)> {
        let b = BufItem::from_raw(*utcb.buffers.get(self.idx)?);
        if b.is_small_obj() {
            return Some((b, Fpage::obj(b.index(), 0, CapRights::ALL)));
        }
        let window = *utcb.buffers.get(self.idx + 1)?;
        Some((b, Fpage::from_raw(window)))
    }

    fn advance(&mut self, utcb: &Utcb) {
        let small = utcb
            .buffers
            .get(self.idx)
            .is_some_and(|b| BufItem::from_raw(*b).is_small_obj());
        self.idx += if small { 1 } else { 2 };
    }
}

fn set_ipc_error(e: L4Error, snd: &mut Utcb, rcv: &mut Utcb) {
    snd.error = e;
    rcv.error = e.in_phase(Phase::Rcv);
}

impl Context {
    /// Transfer the message described by `tag` from this sender to
    /// `receiver`, installing this sender as the receiver's caller if the
    /// sender waits for the reply.
    ///
    /// `rights` are those of the capability the send was invoked through.
    /// Returns whether the transfer succeeded.
    pub(crate) fn transfer_msg(&self, tag: MsgTag, receiver: &Context, rights: CapRights) -> bool {
        let ok = self.copy_utcb_to(tag, receiver, rights);
        let from = self.regs().from;
        {
            let mut dst = receiver.regs.lock();
            dst.tag = tag.with_error(!ok);
            dst.from = from;
        }

        if ok && self.ipc.partner() == Some(receiver.me()) {
            receiver.set_caller(self.me(), rights);
        }
        log::trace!(target: "kestrel::ipc", "{:?} -> {:?}: {:?} ok={}", self.me(), receiver.me(), tag, ok);
        ok
    }

    /// Lock both UTCBs in handle order.
    fn lock_utcbs<'a>(&'a self, receiver: &'a Context) -> (MutexGuard<'a, Utcb>, MutexGuard<'a, Utcb>) {
        if self.me() < receiver.me() {
            let snd = self.utcb.lock();
            let rcv = receiver.utcb.lock();
            (snd, rcv)
        } else {
            let rcv = receiver.utcb.lock();
            let snd = self.utcb.lock();
            (snd, rcv)
        }
    }

    fn copy_utcb_to(&self, tag: MsgTag, receiver: &Context, rights: CapRights) -> bool {
        // Sending to oneself leaves the registers in place.
        if self.me() == receiver.me() {
            return true;
        }

        let ok = {
            let (mut snd, mut rcv) = self.lock_utcbs(receiver);
            let words = tag.words().min(MAX_WORDS);
            rcv.values[..words].copy_from_slice(&snd.values[..words]);
            if tag.items() > 0 {
                self.transfer_msg_items(tag, receiver, &mut snd, &mut rcv, rights)
            } else {
                true
            }
        };

        if ok
            && tag.transfer_fpu()
            && receiver.utcb.lock().buf_desc.inherit_fpu()
            && rights.contains(CapRights::W)
        {
            receiver.set_fpu(self.fpu());
        }
        ok
    }

    fn transfer_msg_items(
        &self,
        tag: MsgTag,
        receiver: &Context,
        snd: &mut Utcb,
        rcv: &mut Utcb,
        rights: CapRights,
    ) -> bool {
        let desc = rcv.buf_desc;
        let mut mem = BufIter::new(desc.mem());
        let mut io = BufIter::new(desc.io());
        let mut obj = BufIter::new(desc.obj());

        let mut idx = tag.words();
        for _ in 0..tag.items() {
            if idx + 1 >= MAX_WORDS {
                set_ipc_error(L4Error::OVERFLOW, snd, rcv);
                return false;
            }
            let item = SndItem::from_raw(snd.values[idx]);
            let mut sfp = Fpage::from_raw(snd.values[idx + 1]);

            if item.is_void() {
                rcv.values[idx] = 0;
                idx += 2;
                continue;
            }

            let bufs = match sfp.ty() {
                FpageType::Memory => &mut mem,
                FpageType::Io => &mut io,
                FpageType::Obj => &mut obj,
                FpageType::Special => {
                    set_ipc_error(L4Error::OVERFLOW, snd, rcv);
                    return false;
                }
            };
            let Some((buf, rfp)) = bufs.get(rcv) else {
                set_ipc_error(L4Error::OVERFLOW, snd, rcv);
                return false;
            };
            if buf.is_void() || buf.raw() & BufItem::MAP == 0 || item.raw() & SndItem::MAP == 0 {
                set_ipc_error(L4Error::OVERFLOW, snd, rcv);
                return false;
            }

            rcv.values[idx] = (item.raw() & !0x0ff6) | (sfp.raw() & 0x0ff0);

            let mut local = false;
            if sfp.ty() == FpageType::Obj {
                sfp = sfp.mask_rights(rights.union(CapRights::RW));
                local = self.try_transfer_local_id(buf, sfp, &mut rcv.values[idx..idx + 2], receiver);
            }
            if !local {
                let err = Space::fpage_map(self.space(), sfp, receiver.space(), rfp, item);
                if !err.ok() {
                    set_ipc_error(err, snd, rcv);
                    return false;
                }
            }

            idx += 2;
            if !item.compound() {
                bufs.advance(rcv);
            }
        }
        true
    }

    /// Hand an object to a receiver that asked for ids instead of
    /// mappings, if it can name the object locally.
    fn try_transfer_local_id(&self, buf: BufItem, sfp: Fpage, rcv_word: &mut [Mword], receiver: &Context) -> bool {
        if !buf.is_rcv_id() {
            return false;
        }
        if self.space().id() == receiver.space().id() {
            rcv_word[0] |= rcv_type::FLEXPAGE;
            rcv_word[1] = sfp.raw();
            return true;
        }

        let Some(cap) = self.space().lookup_obj(sfp.base()) else {
            return false;
        };
        let rights = sfp.rights().intersect(cap.rights);
        if cap.obj.is_local(receiver.space()) {
            rcv_word[0] |= rcv_type::ID;
            rcv_word[1] = cap.obj.obj_id() | rights.bits() as Mword;
            return true;
        }
        false
    }
}
