//! Session statistics, printed as `class.name=value` lines when the session
//! ends.

use std::fmt::Display;

use itertools::Itertools;

pub mod counter;

/// Named values reported by one provider.
pub type StatisticsList = Box<[(String, Box<dyn StatisticValue>)]>;

#[macro_export]
macro_rules! statistics_list {
    ($($name:ident = $value:expr),*) => {
        Box::new(
            [
                $(
                    (::std::stringify!($name).to_owned(), Box::new($value) as Box<dyn $crate::statistics::StatisticValue>)
                ),*
            ]
        )
    };
}

pub trait StatisticsProvider {
    fn class_name(&self) -> &'static str;

    fn statistics(&self) -> StatisticsList;
}

/// Any printable value. Counters are plain integers, view names are strings.
pub trait StatisticValue: Display {}

impl<T: Display> StatisticValue for T {}

pub fn as_text(stats: StatisticsList) -> String {
    stats
        .iter()
        .format_with("\n", |(name, value), f| f(&format_args!("{name}={value}")))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_text() {
        let stats: StatisticsList = statistics_list!(entries = 3u64, view = "outer".to_owned());
        assert_eq!(as_text(stats), "entries=3\nview=outer");
        assert_eq!(as_text(Box::new([])), "");
    }
}
