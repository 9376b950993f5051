pub mod shimcache;
pub mod srum;

pub use self::shimcache::ShimcacheAnalyser;
pub use self::srum::SrumAnalyser;
