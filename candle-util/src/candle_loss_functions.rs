use candle_core::{Result, Tensor};

const EPS: f64 = 1e-8;

/// Numerically stable softplus
///
/// softplus(x) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

/// KL divergence between a diagonal Gaussian and the standard normal
///
/// 0.5 * sum_k ( sigma^2 + mu^2 - 1 - 2 log(sigma) )
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_std` - standard deviation of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_std: &Tensor) -> Result<Tensor> {
    let z_var = z_std.sqr()?;
    let log_var = (z_std.log()? * 2.)?;
    ((z_var + z_mean.sqr()?)? - 1. - log_var)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Elementwise Gaussian negative log-likelihood without the constant
///
/// nll(i,g) = 0.5 * log var(i,g) + (x(i,g) - mean(i,g))^2 / (2 var(i,g))
///
/// * `x_nd` - observed data
/// * `mean_nd` - predicted mean
/// * `var_nd` - predicted variance, strictly positive
///
pub fn gaussian_nll(x_nd: &Tensor, mean_nd: &Tensor, var_nd: &Tensor) -> Result<Tensor> {
    let term1 = (var_nd.log()? * 0.5)?;
    let term2 = x_nd.sub(mean_nd)?.sqr()?.div(&(var_nd * 2.)?)?;
    term1 + term2
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * xp3.log()?)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Negative binomial log-likelihood of count data
///
/// ```text
/// llik(i) = sum_g lgamma(x + θ) - lgamma(θ) - lgamma(x + 1)
///                 + θ log(θ / (θ + μ)) + x log(μ / (θ + μ))
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean
/// * `theta_nd` - inverse dispersion (broadcast over rows)
///
pub fn negative_binomial_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_nd: &Tensor,
) -> Result<Tensor> {
    let theta_nd = theta_nd.broadcast_as(mu_nd.shape())?;
    let log_theta_mu = ((&theta_nd + mu_nd)? + EPS)?.log()?;
    let log_theta = (&theta_nd + EPS)?.log()?;
    let log_mu = (mu_nd + EPS)?.log()?;

    let gamma_terms = ((lgamma_approx(&(x_nd + &theta_nd)?)? - lgamma_approx(&theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.)?)?)?;

    let theta_term = theta_nd.mul(&(&log_theta - &log_theta_mu)?)?;
    let x_term = x_nd.mul(&(log_mu - &log_theta_mu)?)?;

    (gamma_terms + theta_term)?
        .add(&x_term)?
        .sum(x_nd.rank() - 1)
}

/// Zero-inflated negative binomial log-likelihood
///
/// ```text
/// x = 0 : log( sigmoid(-π) NB(0) + sigmoid(π) )
/// x > 0 : log sigmoid(-π) + log NB(x)
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean
/// * `theta_nd` - inverse dispersion (broadcast over rows)
/// * `pi_nd` - logits of the zero-inflation probability
///
pub fn zinb_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_nd: &Tensor,
    pi_nd: &Tensor,
) -> Result<Tensor> {
    let theta_nd = theta_nd.broadcast_as(mu_nd.shape())?;
    let softplus_pi = softplus(&pi_nd.neg()?)?;
    let log_theta = (&theta_nd + EPS)?.log()?;
    let log_theta_mu = ((&theta_nd + mu_nd)? + EPS)?.log()?;
    let pi_theta_log = (pi_nd.neg()? + theta_nd.mul(&(log_theta - &log_theta_mu)?)?)?;

    let case_zero = (softplus(&pi_theta_log)? - &softplus_pi)?;

    let log_mu = (mu_nd + EPS)?.log()?;
    let gamma_terms = ((lgamma_approx(&(x_nd + &theta_nd)?)? - lgamma_approx(&theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.)?)?)?;
    let case_non_zero = ((pi_theta_log - softplus_pi)?
        + x_nd.mul(&(log_mu - log_theta_mu)?)?)?
        .add(&gamma_terms)?;

    let is_zero = x_nd.lt(EPS)?;
    is_zero
        .where_cond(&case_zero, &case_non_zero)?
        .sum(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_lgamma_approx() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::from_vec(vec![1.0f32, 2.0, 5.0, 10.0], (4,), &device)?;
        let vals: Vec<f32> = lgamma_approx(&x)?.to_vec1()?;

        // lgamma(1) = 0, lgamma(2) = 0, lgamma(5) ≈ 3.178, lgamma(10) ≈ 12.802
        assert!((vals[0] - 0.0).abs() < 0.1);
        assert!((vals[1] - 0.0).abs() < 0.1);
        assert!((vals[2] - 3.178).abs() < 0.2);
        assert!((vals[3] - 12.802).abs() < 0.5);
        Ok(())
    }

    #[test]
    fn test_softplus_positive_and_stable() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![-200f32, -5., 0., 5., 200.], (5,), &device)?;
        let vals: Vec<f32> = softplus(&x)?.to_vec1()?;
        assert!(vals.iter().all(|v| v.is_finite() && *v >= 0.));
        assert_abs_diff_eq!(vals[2], 2f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(vals[4], 200., epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_gaussian_nll_perfect_fit() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![0f32, 1., 2.], (1, 3), &device)?;
        let var = x.ones_like()?;
        let nll = gaussian_nll(&x, &x, &var)?.sum_all()?.to_scalar::<f32>()?;
        assert!(nll.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_negative_binomial_likelihood() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![0f32, 1., 2., 5.], (2, 2), &device)?;
        let mu = Tensor::from_vec(vec![0.5f32, 1., 2., 4.], (2, 2), &device)?;
        let theta = Tensor::from_vec(vec![2f32, 3.], (1, 2), &device)?;
        let llik: Vec<f32> = negative_binomial_likelihood(&x, &mu, &theta)?.to_vec1()?;
        assert_eq!(llik.len(), 2);
        assert!(llik.iter().all(|v| v.is_finite() && *v <= 0.));
        Ok(())
    }

    #[test]
    fn test_zinb_reduces_to_nb_without_inflation() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![0f32, 1., 3., 0.], (2, 2), &device)?;
        let mu = Tensor::from_vec(vec![0.5f32, 1., 2., 4.], (2, 2), &device)?;
        let theta = Tensor::from_vec(vec![2f32, 3.], (1, 2), &device)?;
        let pi = (mu.zeros_like()? - 30.)?;

        let nb: Vec<f32> = negative_binomial_likelihood(&x, &mu, &theta)?.to_vec1()?;
        let zinb: Vec<f32> = zinb_likelihood(&x, &mu, &theta, &pi)?.to_vec1()?;
        for (a, b) in nb.iter().zip(zinb.iter()) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
        Ok(())
    }
}
