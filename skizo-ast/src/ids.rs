//! Opaque metadata handles. The domain's metadata registry owns the actual
//! Class/Method/Field/Const records; everything else refers to them through
//! these indices, so lifetimes align to the domain and no cycles form.

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// Index into the domain's class registry.
    ClassId
);
define_id!(
    /// Index into the domain's method table.
    MethodId
);
define_id!(
    /// Index into the domain's field table.
    FieldId
);
define_id!(
    /// Index into the domain's const table.
    ConstId
);
define_id!(
    /// Index into a method's local table.
    LocalId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_plain_indices() {
        assert_eq!(ClassId(3).index(), 3);
        assert_ne!(MethodId(0), MethodId(1));
    }
}
