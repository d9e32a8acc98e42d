//! Keyboard line buffer.
//!
//! The PS/2 interrupt handler (platform code) feeds raw scancodes into
//! [`isr_deliver`]; decoded bytes accumulate in a ring that `sys_read`
//! drains. One task at a time may wait for input.
//!
//! The waiter marks itself blocked *under the buffer lock* before
//! scheduling away. An IRQ landing between unlock and the context
//! switch then finds the task already blocked and wakes it, so the wake
//! is never lost.

use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

use crate::config::KEYBOARD_BUFFER_SIZE;
use crate::sched::{self, TaskPtr, TaskState};
use crate::sync::IrqMutex;

struct KeyboardState {
    decoder: Keyboard<Us104Key, ScancodeSet1>,
    buf: [u8; KEYBOARD_BUFFER_SIZE],
    head: usize,
    tail: usize,
    count: usize,
    waiter: Option<TaskPtr>,
}

impl KeyboardState {
    fn push(&mut self, byte: u8) {
        if self.count == KEYBOARD_BUFFER_SIZE {
            // Ring full: drop the oldest byte.
            self.head = (self.head + 1) % KEYBOARD_BUFFER_SIZE;
            self.count -= 1;
        }
        self.buf[self.tail] = byte;
        self.tail = (self.tail + 1) % KEYBOARD_BUFFER_SIZE;
        self.count += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % KEYBOARD_BUFFER_SIZE;
        self.count -= 1;
        Some(byte)
    }
}

static KEYBOARD: IrqMutex<Option<KeyboardState>> = IrqMutex::new(None);

fn with_state<T>(f: impl FnOnce(&mut KeyboardState) -> T) -> T {
    let mut guard = KEYBOARD.lock();
    let state = guard.get_or_insert_with(|| KeyboardState {
        decoder: Keyboard::new(ScancodeSet1::new(), Us104Key, HandleControl::Ignore),
        buf: [0; KEYBOARD_BUFFER_SIZE],
        head: 0,
        tail: 0,
        count: 0,
        waiter: None,
    });
    f(state)
}

/// Interrupt-side entry: decode one scancode, deposit the byte and
/// wake the waiter if any.
pub fn isr_deliver(scancode: u8) {
    let waiter = with_state(|state| {
        let event = match state.decoder.add_byte(scancode) {
            Ok(Some(event)) => event,
            _ => return None,
        };
        let key = state.decoder.process_keyevent(event)?;
        match key {
            DecodedKey::Unicode(c) if c.is_ascii() => state.push(c as u8),
            _ => return None,
        }
        state.waiter.take()
    });
    if let Some(task) = waiter {
        sched::wake(task);
    }
}

/// Bytes currently buffered.
pub fn available() -> usize {
    with_state(|state| state.count)
}

/// Read up to `buf.len()` bytes, blocking `cur` until at least one is
/// available.
pub fn read_blocking(cur: TaskPtr, buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    loop {
        let drained = with_state(|state| {
            if state.count > 0 {
                let mut n = 0;
                while n < buf.len() {
                    match state.pop() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
                Some(n)
            } else {
                state.waiter = Some(cur);
                // Block under the lock; see module docs.
                // SAFETY: cur is the running task.
                unsafe {
                    let c = cur.get_mut();
                    c.state = TaskState::Blocked;
                    c.wait_channel = &KEYBOARD as *const _ as usize;
                }
                None
            }
        });
        match drained {
            Some(n) => return n,
            None => sched::schedule(),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Scancode-set-1 make codes.
    const SC_A: u8 = 0x1e;
    const SC_B: u8 = 0x30;
    const SC_A_BREAK: u8 = 0x9e;

    fn drain_all() {
        with_state(|state| while state.pop().is_some() {});
    }

    // One combined test: the line buffer is a global, so splitting
    // these across parallel test threads would interleave their input.
    #[test]
    fn scancodes_decode_and_read_drains() {
        crate::sched::scheduler::tests::ensure_test_init();
        drain_all();
        isr_deliver(SC_A);
        isr_deliver(SC_A_BREAK);
        isr_deliver(SC_B);
        assert!(available() >= 2);

        let t = {
            let task = crate::sched::Task::new_kernel("rd", noop, 0, 20);
            TaskPtr::new(core::ptr::NonNull::from(alloc::boxed::Box::leak(task)))
        };
        let mut buf = [0u8; 4];
        let n = read_blocking(t, &mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"ab");
        // SAFETY: test-owned task, never enqueued.
        unsafe { drop(alloc::boxed::Box::from_raw(t.as_ptr().as_ptr())) };
        drain_all();
    }

    extern "C" fn noop(_arg: usize) {}
}
