//! Little-endian binary (en/de)coding used by the legacy geometry buffer and
//! the attribute buffers. A small `Encode`/`Decode` trait pair over
//! `bytes::{Buf, BufMut}`.

use bytes::{Buf, BufMut};
use glam::{Quat, Vec2, Vec3, Vec4};

pub trait Encode {
    fn encode<B>(&self, buf: B)
    where
        B: BufMut;
}

pub trait Decode: Sized {
    type Error;

    fn decode<B>(buf: B) -> Result<Self, Self::Error>
    where
        B: Buf;
}

/// Raised when a decode reads past the end of the buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[error("unexpected eof reading {on}: needed {expected} bytes, had {remaining}")]
pub struct EofError {
    pub on: &'static str,
    pub expected: usize,
    pub remaining: usize,
}

fn require<B: Buf>(buf: &B, on: &'static str, expected: usize) -> Result<(), EofError> {
    if buf.remaining() < expected {
        Err(EofError {
            on,
            expected,
            remaining: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

macro_rules! int_impls {
    ($($id:ident),*$(,)?) => {
        $(
            impl Encode for $id {
                #[inline]
                fn encode<B>(&self, mut buf: B)
                where
                    B: BufMut,
                {
                    buf.put_slice(&self.to_le_bytes());
                }
            }

            impl Decode for $id {
                type Error = EofError;

                #[inline]
                fn decode<B>(mut buf: B) -> Result<Self, Self::Error>
                where
                    B: Buf,
                {
                    require(&buf, stringify!($id), std::mem::size_of::<Self>())?;
                    let mut bytes = [0u8; std::mem::size_of::<Self>()];
                    buf.copy_to_slice(&mut bytes);
                    Ok(Self::from_le_bytes(bytes))
                }
            }
        )*
    };
}

int_impls! {
    u8, u16, u32, u64, i8, i16, i32, i64, f32, f64,
}

impl Encode for Vec3 {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        self.x.encode(&mut buf);
        self.y.encode(&mut buf);
        self.z.encode(&mut buf);
    }
}

impl Decode for Vec3 {
    type Error = EofError;

    fn decode<B>(mut buf: B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        let x = f32::decode(&mut buf)?;
        let y = f32::decode(&mut buf)?;
        let z = f32::decode(&mut buf)?;
        Ok(Self { x, y, z })
    }
}

impl Encode for Vec2 {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        self.x.encode(&mut buf);
        self.y.encode(&mut buf);
    }
}

impl Decode for Vec2 {
    type Error = EofError;

    fn decode<B>(mut buf: B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        let x = f32::decode(&mut buf)?;
        let y = f32::decode(&mut buf)?;
        Ok(Self { x, y })
    }
}

impl Encode for Vec4 {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        self.x.encode(&mut buf);
        self.y.encode(&mut buf);
        self.z.encode(&mut buf);
        self.w.encode(&mut buf);
    }
}

impl Decode for Vec4 {
    type Error = EofError;

    fn decode<B>(mut buf: B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        let x = f32::decode(&mut buf)?;
        let y = f32::decode(&mut buf)?;
        let z = f32::decode(&mut buf)?;
        let w = f32::decode(&mut buf)?;
        Ok(Self::new(x, y, z, w))
    }
}

impl Encode for Quat {
    fn encode<B>(&self, buf: B)
    where
        B: BufMut,
    {
        Vec4::from(*self).encode(buf);
    }
}

impl Decode for Quat {
    type Error = EofError;

    fn decode<B>(buf: B) -> Result<Self, Self::Error>
    where
        B: Buf,
    {
        Vec4::decode(buf).map(Self::from_vec4)
    }
}
