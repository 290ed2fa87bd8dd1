//! Boot-time configuration.

use log::warn;

use crate::placement::StrategyKind;

/// The number of pages the kernel pool keeps back from the user pool by
/// default: 512 allocatable pages plus one page of metadata.
pub const DEFAULT_KERNEL_RESERVE: usize = 513;

/// Settings fixed when a [`PageAllocator`](crate::PageAllocator) is built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The placement strategy used by both pools.
    pub strategy: StrategyKind,
    /// The largest number of pages given to the user pool.
    pub user_page_limit: usize,
    /// The number of pages held back for the kernel pool before the user
    /// pool takes the rest. On machines with fewer than twice this many
    /// pages, the kernel pool is held to half of memory instead.
    pub kernel_reserve: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::new(StrategyKind::default())
    }
}

impl Config {
    /// Returns a configuration using `strategy` with no user page limit and
    /// the default kernel reserve.
    pub const fn new(strategy: StrategyKind) -> Config {
        Config {
            strategy,
            user_page_limit: usize::MAX,
            kernel_reserve: DEFAULT_KERNEL_RESERVE,
        }
    }

    /// Returns `self` with the user pool capped at `limit` pages.
    pub const fn with_user_page_limit(self, limit: usize) -> Config {
        Config {
            user_page_limit: limit,
            ..self
        }
    }

    /// Returns `self` with `pages` pages held back for the kernel pool.
    pub const fn with_kernel_reserve(self, pages: usize) -> Config {
        Config {
            kernel_reserve: pages,
            ..self
        }
    }

    /// Returns how many of `num_pages` pages go to the user pool; the kernel
    /// pool receives the rest.
    pub fn user_pages(&self, num_pages: usize) -> usize {
        let reserve = self.kernel_reserve.min(num_pages - num_pages / 2);
        (num_pages - reserve).min(self.user_page_limit)
    }

    /// Parses a kernel command line.
    ///
    /// Recognizes `-ma=STRATEGY`, where `STRATEGY` is a selector `0`..`3` or
    /// a name accepted by [`StrategyKind::from_cmdline`], and `-ul=COUNT`.
    /// Other options are ignored. Unparseable values are logged and leave the
    /// default in place.
    pub fn from_cmdline(cmdline: &str) -> Config {
        let mut config = Config::default();

        for option in cmdline.split_ascii_whitespace() {
            let Some((name, value)) = option.split_once('=') else {
                continue;
            };

            match name {
                "-ma" => match StrategyKind::from_cmdline(value) {
                    Ok(strategy) => config.strategy = strategy,
                    Err(e) => warn!("ignoring -ma={value}: {e}"),
                },

                "-ul" => match value.parse() {
                    Ok(limit) => config.user_page_limit = limit,
                    Err(e) => warn!("ignoring -ul={value}: {e}"),
                },

                _ => (),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.strategy, StrategyKind::FirstFit);
        assert_eq!(config.user_page_limit, usize::MAX);
        assert_eq!(config.kernel_reserve, DEFAULT_KERNEL_RESERVE);
    }

    #[test]
    fn kernel_reserve_comes_first() {
        let config = Config::default();
        assert_eq!(config.user_pages(1100), 1100 - 513);
        assert_eq!(config.user_pages(1026), 513);
        assert_eq!(config.with_user_page_limit(100).user_pages(1100), 100);

        let config = config.with_kernel_reserve(10);
        assert_eq!(config.user_pages(64), 54);
        assert_eq!(config.user_pages(0), 0);
    }

    #[test]
    fn small_machines_split_in_half() {
        let config = Config::default();
        assert_eq!(config.user_pages(1024), 512);
        assert_eq!(config.user_pages(64), 32);
        assert_eq!(config.user_pages(7), 3);
        assert_eq!(config.user_pages(1), 0);
    }

    #[test]
    fn cmdline_options() {
        let config = Config::from_cmdline("-q -ma=3 -ul=128 run alloctest");
        assert_eq!(config.strategy, StrategyKind::Buddy);
        assert_eq!(config.user_page_limit, 128);

        let config = Config::from_cmdline("-ma=next-fit");
        assert_eq!(config, Config::new(StrategyKind::NextFit));
    }

    #[test]
    fn bad_cmdline_values_keep_defaults() {
        // An out-of-range selector means first fit.
        let config = Config::from_cmdline("-ma=2 -ma=9");
        assert_eq!(config.strategy, StrategyKind::FirstFit);

        let config = Config::from_cmdline("-ma=bf -ma=quick -ul=lots");
        assert_eq!(config, Config::new(StrategyKind::BestFit));
    }
}
