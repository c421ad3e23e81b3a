pub mod params;
pub mod via;

pub use params::parse_params;
pub use via::ViaHeader;

/// ヘッダ値を構造化するための共通トレイト
pub trait HeaderCodec: Sized {
    const NAME: &'static str;
    fn parse(value: &str) -> anyhow::Result<Self>;
}
