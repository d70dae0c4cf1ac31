use serde::{Deserialize, Serialize};

/// A peer setting that interface defaults may overwrite while `overridable` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOption<T> {
    /// Current value.
    pub value: T,
    /// Whether interface default propagation may replace the value.
    pub overridable: bool,
}

impl<T> ConfigOption<T> {
    /// Creates an option.
    pub const fn new(value: T, overridable: bool) -> Self {
        Self { value, overridable }
    }

    /// Current value.
    pub const fn get(&self) -> &T {
        &self.value
    }

    /// Replaces the value unconditionally.
    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// Replaces the value only when the option is overridable.
    ///
    /// Returns whether the value was replaced.
    pub fn try_set(&mut self, value: T) -> bool {
        if self.overridable {
            self.value = value;
        }
        self.overridable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_set_respects_flag() {
        let mut fixed = ConfigOption::new(25, false);
        assert!(!fixed.try_set(16));
        assert_eq!(*fixed.get(), 25);

        let mut open = ConfigOption::new(25, true);
        assert!(open.try_set(16));
        assert_eq!(*open.get(), 16);
    }

    #[test]
    fn set_ignores_flag() {
        let mut fixed = ConfigOption::new(String::from("a"), false);
        fixed.set("b".into());
        assert_eq!(fixed.value, "b");
    }
}
