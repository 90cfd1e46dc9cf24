//! Debounce: coalesce bursts of values into the last value of each burst.
//!
//! The window opens on the first value after idle and is not extended by later values.
//! Closing the input flushes a pending value before the output closes.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

/// Debounce `input`, emitting the last value of each burst once `delay` has passed since the
/// burst's first value.
pub fn debounce<T: Send + 'static>(delay: Duration, input: mpsc::Receiver<T>) -> mpsc::Receiver<T> {
    debounce_with_buffer(delay, input, 0)
}

/// Like [`debounce`] with an explicit output buffer. A buffer of 0 gets the smallest channel
/// tokio offers (1).
pub fn debounce_with_buffer<T: Send + 'static>(
    delay: Duration,
    mut input: mpsc::Receiver<T>,
    buffer: usize,
) -> mpsc::Receiver<T> {
    let (output, rx) = mpsc::channel(buffer.max(1));

    tokio::spawn(async move {
        while let Some(mut pending) = input.recv().await {
            let deadline = sleep_until(Instant::now() + delay);
            tokio::pin!(deadline);
            let mut input_closed = false;

            loop {
                tokio::select! {
                    next = input.recv() => match next {
                        Some(value) => pending = value,
                        None => {
                            input_closed = true;
                            break;
                        }
                    },
                    () = &mut deadline => break,
                }
            }

            // Absorb input while waiting for output capacity.
            let permit = loop {
                tokio::select! {
                    permit = output.reserve() => break permit,
                    next = input.recv(), if !input_closed => match next {
                        Some(value) => pending = value,
                        None => input_closed = true,
                    },
                }
            };
            match permit {
                Ok(permit) => permit.send(pending),
                Err(_) => {
                    tracing::debug!("debounce output dropped, stopping");
                    return;
                }
            }

            if input_closed {
                break;
            }
        }
    });

    rx
}
