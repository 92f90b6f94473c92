use std::any::Any;

/// Best effort text of a panic payload captured by `catch_unwind`.
pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic occurred".to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::panic::panic_message;

    #[test]
    pub fn panic_message_test() {
        let r = std::panic::catch_unwind(|| panic!("boom {}", 1));
        assert_eq!(panic_message(&r.unwrap_err()), "boom 1");

        let r = std::panic::catch_unwind(|| panic!("static"));
        assert_eq!(panic_message(&r.unwrap_err()), "static");
    }
}
