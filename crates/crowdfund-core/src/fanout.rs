use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
};

/// Applies `f` to every item with at most `window` calls running at once.
/// Results come back in input order regardless of completion order.
pub fn bounded_map<T, R, F>(items: &[T], window: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = window.max(1).min(items.len());
    if workers <= 1 {
        return items.iter().map(f).collect();
    }

    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new((0..items.len()).map(|_| None).collect());
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(idx) else {
                    break;
                };
                let result = f(item);
                slots
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())[idx] = Some(result);
            });
        }
    });
    slots
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Duration;

    #[test]
    fn preserves_input_order_under_random_latency() {
        let items: Vec<u64> = (0..40).collect();
        let out = bounded_map(&items, 6, |n| {
            let jitter = rand::thread_rng().gen_range(0..5);
            thread::sleep(Duration::from_millis(jitter));
            n * 2
        });
        assert_eq!(out, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_the_window() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = vec![(); 25];
        bounded_map(&items, 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn empty_input_and_zero_window() {
        let empty: Vec<u8> = Vec::new();
        assert!(bounded_map(&empty, 4, |b| *b).is_empty());
        assert_eq!(bounded_map(&[1, 2, 3], 0, |n| n + 1), vec![2, 3, 4]);
    }
}
