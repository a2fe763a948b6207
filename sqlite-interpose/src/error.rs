use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("shadow statement prepare failed with code {code}"))]
    ShadowPrepare { code: i32 },

    #[snafu(display("sql text contains an interior nul byte"))]
    InteriorNul,

    #[snafu(display("original allocator returned null for {bytes} bytes"))]
    ShadowAlloc { bytes: usize },
}
