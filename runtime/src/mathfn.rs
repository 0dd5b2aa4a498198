// Scalar math exports: thin forwards onto the host math library.

macro_rules! unary_math {
    ($($export:ident => $method:ident),+ $(,)?) => {$(
        #[no_mangle]
        pub extern "C" fn $export(x: f64) -> f64 {
            x.$method()
        }
    )+}
}

unary_math! {
    eigen_sqrt => sqrt,
    eigen_abs => abs,
    eigen_log => ln,
    eigen_exp => exp,
    eigen_sin => sin,
    eigen_cos => cos,
    eigen_tan => tan,
    eigen_floor => floor,
    eigen_ceil => ceil,
    eigen_round => round,
}

#[no_mangle]
pub extern "C" fn eigen_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_match_std() {
        assert_eq!(eigen_sqrt(81.0), 9.0);
        assert_eq!(eigen_abs(-3.5), 3.5);
        assert_eq!(eigen_pow(2.0, 10.0), 1024.0);
        assert_eq!(eigen_floor(2.7), 2.0);
        assert_eq!(eigen_ceil(2.1), 3.0);
        assert_eq!(eigen_round(2.5), 3.0);
        assert!((eigen_log(eigen_exp(1.0)) - 1.0).abs() < 1e-15);
        assert!(eigen_sqrt(-1.0).is_nan());
    }
}
