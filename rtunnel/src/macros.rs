/// Poison-tolerant lock helpers: a poisoned lock is reported as an `anyhow` error
/// naming the guarded resource.
#[macro_export]
macro_rules! lock {
    ($mutex:expr, $name:expr) => {
        $mutex
            .lock()
            .map_err(|_| anyhow::anyhow!("{} lock poisoned", $name))
    };
}

#[macro_export]
macro_rules! read_lock {
    ($rw:expr, $name:expr) => {
        $rw.read()
            .map_err(|_| anyhow::anyhow!("{} lock poisoned", $name))
    };
}

#[macro_export]
macro_rules! write_lock {
    ($rw:expr, $name:expr) => {
        $rw.write()
            .map_err(|_| anyhow::anyhow!("{} lock poisoned", $name))
    };
}

/// Retry `$expr` until it returns `Ok`, sleeping `$dur` between attempts and giving up
/// after `$times` failures with the last error.
#[macro_export]
macro_rules! retry_fn {
    ($expr:expr, $dur:expr, $times:expr) => {{
        let mut attempt = 0usize;
        loop {
            match $expr {
                std::result::Result::Ok(val) => break std::result::Result::Ok(val),
                std::result::Result::Err(err) => {
                    attempt += 1;
                    if attempt >= $times {
                        break std::result::Result::Err(err);
                    }
                    warn!(
                        "retry function({}) attempt {} error. {}",
                        stringify!($expr),
                        attempt,
                        err
                    );
                    std::thread::sleep($dur);
                }
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use std::borrow::BorrowMut;
    use std::time::Duration;

    fn mock(value: &mut i64, succeed_at: i64) -> Result<String, std::io::Error> {
        *value += 1;
        if *value < succeed_at {
            Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "a"))
        } else {
            Ok("V".to_string())
        }
    }

    #[test]
    pub fn retry_result_test() {
        let mut value = 0i64;
        let n: Result<String, std::io::Error> =
            retry_fn!(mock(value.borrow_mut(), 10), Duration::from_millis(1), 20);

        assert_eq!(n.unwrap(), "V");
        assert_eq!(value, 10i64);
    }

    #[test]
    pub fn retry_give_up_test() {
        let mut value = 0i64;
        let n: Result<String, std::io::Error> =
            retry_fn!(mock(value.borrow_mut(), 100), Duration::from_millis(1), 3);

        assert!(n.is_err());
        assert_eq!(value, 3i64);
    }

    #[test]
    pub fn lock_poison_test() {
        let m = std::sync::Arc::new(std::sync::Mutex::new(1));
        let m1 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m1.lock().unwrap();
            panic!("poison");
        })
        .join();

        let r: anyhow::Result<_> = lock!(m, "test");
        assert!(r.is_err());
    }
}
