macro_rules! ready {
    ($e:expr) => {
        match $e {
            std::task::Poll::Ready(v) => v,
            std::task::Poll::Pending => return std::task::Poll::Pending,
        }
    };
}

pub(crate) mod drain;
pub(crate) mod exec;
pub(crate) mod serial;
pub(crate) mod transfer;
